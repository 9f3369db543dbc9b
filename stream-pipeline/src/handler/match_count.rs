use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::handler::{Handler, HandlerContext, HandlerFactory, Outcome};
use crate::types::Message;

/// Counts messages whose payload equals a literal, acknowledging everything
pub struct MatchCountHandler {
    target: String,
    instance: usize,
    count: u64,
}

impl MatchCountHandler {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            instance: 0,
            count: 0,
        }
    }

    /// Factory creating one counter per handler instance
    pub fn factory(target: impl Into<String>) -> impl HandlerFactory {
        let target = target.into();
        move |_: &HandlerContext| -> Box<dyn Handler> { Box::new(MatchCountHandler::new(target.clone())) }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

#[async_trait]
impl Handler for MatchCountHandler {
    async fn on_start(&mut self, context: &HandlerContext) -> Result<()> {
        self.instance = context.instance;
        info!(
            instance = context.instance,
            worker = context.worker,
            target = self.target,
            "Match counter started"
        );
        Ok(())
    }

    async fn on_message(&mut self, message: &Message) -> Outcome {
        let input = message.payload_str();
        debug!(
            instance = self.instance,
            partition = message.partition(),
            offset = message.offset(),
            "Input from log is: [{input}]"
        );

        if input == self.target.as_str() {
            self.count += 1;
            info!(
                instance = self.instance,
                count = self.count,
                "Found a {}! Count is now {}",
                self.target,
                self.count
            );
        }

        Outcome::Ack
    }

    async fn on_stop(&mut self) {
        info!(
            instance = self.instance,
            count = self.count,
            "Match counter stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_only_exact_matches() {
        let mut handler = MatchCountHandler::new("Hello World");

        for payload in ["Hello World", "hello world", "Hello World!", "Hello World"] {
            let outcome = handler.on_message(&Message::new(0, 0, payload)).await;
            assert_eq!(outcome, Outcome::Ack);
        }

        assert_eq!(handler.count(), 2);
    }

    #[tokio::test]
    async fn test_factory_creates_independent_instances() {
        let factory = MatchCountHandler::factory("x");
        let context = HandlerContext {
            instance: 0,
            worker: 0,
            instances: 2,
        };

        let mut first = factory.create(&context);
        let mut second = factory.create(&HandlerContext {
            instance: 1,
            ..context
        });
        first.on_start(&context).await.unwrap();

        assert_eq!(first.on_message(&Message::new(0, 0, "x")).await, Outcome::Ack);
        assert_eq!(second.on_message(&Message::new(0, 1, "y")).await, Outcome::Ack);
    }
}
