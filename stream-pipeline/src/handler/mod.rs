// Handler module - per-instance message processing
pub mod instance;
pub mod match_count;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::Message;

pub use instance::{Delivery, DeliveryStats, HandlerInstance, InstanceDeps};
pub use match_count::MatchCountHandler;

/// Terminal result of one handler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Fail(String),
}

/// Identity of a handler instance, passed to the factory and to `on_start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerContext {
    /// Index of this instance, in `0..instances`
    pub instance: usize,
    /// Logical worker the instance is placed on
    pub worker: usize,
    /// Total number of instances in the pipeline
    pub instances: usize,
}

/// A stateful processing unit. Each instance is owned by a single task, so
/// its state needs no synchronization; state shared between instances must
/// live in an external store.
#[async_trait]
pub trait Handler: Send {
    async fn on_start(&mut self, _context: &HandlerContext) -> Result<()> {
        Ok(())
    }

    async fn on_message(&mut self, message: &Message) -> Outcome;

    async fn on_stop(&mut self) {}
}

/// Creates fresh handler instances every time a pipeline starts
pub trait HandlerFactory: Send + Sync {
    fn create(&self, context: &HandlerContext) -> Box<dyn Handler>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&HandlerContext) -> Box<dyn Handler> + Send + Sync,
{
    fn create(&self, context: &HandlerContext) -> Box<dyn Handler> {
        self(context)
    }
}
