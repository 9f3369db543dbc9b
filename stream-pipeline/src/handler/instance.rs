//! Handler Instance - Dedicated task driving one handler
//!
//! Each instance owns its handler and a bounded queue of deliveries. A
//! delivery is processed to a terminal outcome before the next one is taken:
//!
//! Received -> Processing -> Acked
//!                        -> Failed -> Retrying -> Processing ...
//!                                  -> DeadLettered (retries exhausted)
//!
//! Acked and dead-lettered deliveries are acknowledged to the offset tracker.
//! A delivery whose processing is cut short by the shutdown grace period, or
//! whose dead letter could not be written, is abandoned: it stays
//! unacknowledged and is delivered again by the next run.
//!
//! A handler that panics while processing a message is treated as having
//! returned `Fail`, so the instance keeps serving its queue.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dead_letter::DeadLetterSink;
use crate::error::{DeadLetterError, PipelineError};
use crate::handler::{Handler, HandlerContext, Outcome};
use crate::metrics_consts::{HANDLER_DURATION_MS, HANDLER_FAILURES, MESSAGES_COMPLETED};
use crate::offset_tracker::OffsetTracker;
use crate::retry::{retry_transient, RetryPolicy};
use crate::types::Message;

/// A message handed to a handler instance. The permit holds one slot of the
/// in-flight bound and is released once the delivery is done with.
pub struct Delivery {
    pub message: Message,
    _permit: OwnedSemaphorePermit,
}

impl Delivery {
    pub fn new(message: Message, permit: OwnedSemaphorePermit) -> Self {
        Self {
            message,
            _permit: permit,
        }
    }
}

/// Counts of terminal outcomes for one pipeline run
#[derive(Debug, Default)]
pub struct DeliveryStats {
    acked: AtomicU64,
    dead_lettered: AtomicU64,
    abandoned: AtomicU64,
}

impl DeliveryStats {
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    fn record(&self, terminal: &Terminal) {
        let (counter, status) = match terminal {
            Terminal::Acked => (&self.acked, "acked"),
            Terminal::DeadLettered => (&self.dead_lettered, "dead_lettered"),
            Terminal::Abandoned(_) => (&self.abandoned, "abandoned"),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(MESSAGES_COMPLETED, "status" => status).increment(1);
    }
}

/// Everything an instance needs besides its handler, shared by all instances
/// of a run
pub struct InstanceDeps {
    pub tracker: Arc<OffsetTracker>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub max_retries: u32,
    pub retry_policy: RetryPolicy,
    pub io_max_retries: u32,
    pub handler_timeout: Duration,
    /// Cancelled once the shutdown grace period has elapsed
    pub grace_expired: CancellationToken,
    pub fatal_errors: mpsc::UnboundedSender<PipelineError>,
    pub stats: Arc<DeliveryStats>,
}

#[derive(Debug, PartialEq, Eq)]
enum Terminal {
    Acked,
    DeadLettered,
    Abandoned(String),
}

pub struct HandlerInstance {
    context: HandlerContext,
    sender: mpsc::Sender<Delivery>,
    handle: Option<JoinHandle<()>>,
}

impl HandlerInstance {
    pub fn spawn(
        context: HandlerContext,
        handler: Box<dyn Handler>,
        deps: Arc<InstanceDeps>,
        queue_capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity);

        let handle = tokio::spawn(async move {
            Self::run(context, handler, receiver, deps).await;
        });

        Self {
            context,
            sender,
            handle: Some(handle),
        }
    }

    /// Sender used by readers to hand over deliveries
    pub fn sender(&self) -> mpsc::Sender<Delivery> {
        self.sender.clone()
    }

    /// Wait for the instance to drain its queue. Readers must have dropped
    /// their senders, otherwise the queue never closes.
    pub async fn shutdown(mut self) {
        drop(self.sender);

        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(()) => {
                    debug!(instance = self.context.instance, "Handler instance shut down");
                }
                Err(e) => {
                    warn!(
                        instance = self.context.instance,
                        "Handler instance panicked during shutdown: {e:#}"
                    );
                }
            }
        }
    }

    async fn run(
        context: HandlerContext,
        mut handler: Box<dyn Handler>,
        mut receiver: mpsc::Receiver<Delivery>,
        deps: Arc<InstanceDeps>,
    ) {
        let started = AssertUnwindSafe(handler.on_start(&context))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(anyhow::anyhow!("panicked: {}", panic_message(&*panic))));
        if let Err(e) = started {
            error!(instance = context.instance, "Handler failed to start: {:#}", e);
            let error = PipelineError::Fatal(format!(
                "handler instance {} failed to start: {e:#}",
                context.instance
            ));
            if deps.fatal_errors.send(error).is_err() {
                debug!(instance = context.instance, "Pipeline already stopping");
            }
            return;
        }

        info!(
            instance = context.instance,
            worker = context.worker,
            "Handler instance started"
        );

        loop {
            let delivery = tokio::select! {
                biased;
                _ = deps.grace_expired.cancelled() => break,
                delivery = receiver.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let terminal = Self::process(handler.as_mut(), &delivery.message, &deps).await;
            Self::complete(&context, &delivery.message, &terminal, &deps);
            drop(delivery);
        }

        // Anything still queued is left unacknowledged
        receiver.close();
        while let Some(delivery) = receiver.recv().await {
            deps.stats
                .record(&Terminal::Abandoned("not started before shutdown".to_string()));
            drop(delivery);
        }

        handler.on_stop().await;
        info!(instance = context.instance, "Handler instance stopped");
    }

    fn complete(context: &HandlerContext, message: &Message, terminal: &Terminal, deps: &InstanceDeps) {
        match terminal {
            Terminal::Acked | Terminal::DeadLettered => {
                let outcome = deps
                    .tracker
                    .acknowledge(message.partition(), message.offset());
                debug!(
                    instance = context.instance,
                    partition = message.partition(),
                    offset = message.offset(),
                    outcome = ?outcome,
                    "Acknowledged message"
                );
            }
            Terminal::Abandoned(reason) => {
                warn!(
                    instance = context.instance,
                    partition = message.partition(),
                    offset = message.offset(),
                    reason = reason,
                    "Abandoned message, it will be redelivered"
                );
            }
        }
        deps.stats.record(terminal);
    }

    /// Run the handler on one message until it reaches a terminal outcome
    async fn process(handler: &mut dyn Handler, message: &Message, deps: &InstanceDeps) -> Terminal {
        let mut retries = 0;
        loop {
            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = deps.grace_expired.cancelled() => {
                    return Terminal::Abandoned("shutdown grace period elapsed".to_string());
                }
                result = tokio::time::timeout(
                    deps.handler_timeout,
                    AssertUnwindSafe(handler.on_message(message)).catch_unwind(),
                ) => {
                    match result {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(panic)) => {
                            error!(
                                partition = message.partition(),
                                offset = message.offset(),
                                "Handler panicked: {}",
                                panic_message(&*panic)
                            );
                            Outcome::Fail(format!("handler panicked: {}", panic_message(&*panic)))
                        }
                        Err(_) => Outcome::Fail(format!(
                            "handler timed out after {}ms",
                            deps.handler_timeout.as_millis()
                        )),
                    }
                }
            };
            metrics::histogram!(HANDLER_DURATION_MS).record(started.elapsed().as_millis() as f64);

            let reason = match outcome {
                Outcome::Ack => return Terminal::Acked,
                Outcome::Fail(reason) => reason,
            };
            metrics::counter!(HANDLER_FAILURES).increment(1);

            if retries >= deps.max_retries {
                return Self::dead_letter(message, &reason, retries + 1, deps).await;
            }

            retries += 1;
            let backoff = deps.retry_policy.retry_interval(retries);
            warn!(
                partition = message.partition(),
                offset = message.offset(),
                retry = retries,
                backoff_ms = backoff.as_millis() as u64,
                reason = reason,
                "Handler failed, retrying message"
            );

            tokio::select! {
                biased;
                _ = deps.grace_expired.cancelled() => {
                    return Terminal::Abandoned("shutdown grace period elapsed".to_string());
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn dead_letter(message: &Message, reason: &str, attempts: u32, deps: &InstanceDeps) -> Terminal {
        let reason = format!("failed after {attempts} attempts: {reason}");

        let written = retry_transient(
            &deps.retry_policy,
            deps.io_max_retries,
            "writing dead letter",
            |_: &DeadLetterError| true,
            || deps.dead_letters.write(message, &reason),
        )
        .await;

        match written {
            Ok(()) => {
                warn!(
                    partition = message.partition(),
                    offset = message.offset(),
                    reason = reason,
                    "Message dead-lettered"
                );
                Terminal::DeadLettered
            }
            Err(exhausted) => {
                error!(
                    partition = message.partition(),
                    offset = message.offset(),
                    attempts = exhausted.attempts,
                    error = %exhausted.error,
                    "Could not write dead letter"
                );
                let escalated = PipelineError::TransientIo {
                    component: "dead-letter sink",
                    attempts: exhausted.attempts,
                    reason: exhausted.error.to_string(),
                };
                if deps.fatal_errors.send(escalated).is_err() {
                    debug!("Pipeline already stopping");
                }
                Terminal::Abandoned(format!("dead letter not written: {}", exhausted.error))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}
