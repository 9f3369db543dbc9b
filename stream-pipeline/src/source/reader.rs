//! Partition Reader - Feeds messages from owned partitions to handler instances
//!
//! Every reader owns a disjoint set of partitions and reads each of them
//! sequentially from its resume position. Before a message is handed over it
//! takes one slot of the pipeline-wide in-flight bound, so a reader stalls
//! instead of buffering once handlers fall behind.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::distributor::Distributor;
use crate::error::{FetchError, PipelineError};
use crate::handler::Delivery;
use crate::metrics_consts::{SOURCE_BACKPRESSURE_TOTAL, SOURCE_FETCH_ERRORS, SOURCE_MESSAGES_FETCHED};
use crate::offset_tracker::OffsetTracker;
use crate::retry::{retry_transient, RetryPolicy};
use crate::source::log::LogReader;
use crate::types::Message;

/// Split partitions round-robin over `parallelism` readers. Readers beyond the
/// number of partitions get nothing and stay idle.
pub fn assign_partitions(partitions: &[i32], parallelism: usize) -> Vec<Vec<i32>> {
    let mut assignments = vec![Vec::new(); parallelism];
    if parallelism == 0 {
        return assignments;
    }
    for (index, partition) in partitions.iter().enumerate() {
        assignments[index % parallelism].push(*partition);
    }
    assignments
}

/// What every reader of a run shares
#[derive(Clone)]
pub struct ReaderContext {
    pub topic: String,
    pub log: Arc<dyn LogReader>,
    pub tracker: Arc<OffsetTracker>,
    /// One queue per handler instance, indexed by instance
    pub handlers: Vec<mpsc::Sender<Delivery>>,
    pub in_flight: Arc<Semaphore>,
    pub fetch_batch_size: usize,
    pub poll_interval: Duration,
    pub retry_policy: RetryPolicy,
    pub io_max_retries: u32,
    pub cancel: CancellationToken,
    pub fatal_errors: mpsc::UnboundedSender<PipelineError>,
}

struct PartitionPosition {
    partition: i32,
    next_offset: i64,
}

enum Handover {
    Delivered,
    Cancelled,
    Closed,
}

pub struct PartitionReader {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl PartitionReader {
    /// Start a reader for `positions`, pairs of partition and first offset to read
    pub fn spawn(
        id: usize,
        positions: Vec<(i32, i64)>,
        distributor: Distributor,
        context: ReaderContext,
    ) -> Self {
        let positions = positions
            .into_iter()
            .map(|(partition, next_offset)| PartitionPosition {
                partition,
                next_offset,
            })
            .collect();

        let handle = tokio::spawn(async move {
            Self::run(id, positions, distributor, context).await;
        });

        Self {
            id,
            handle: Some(handle),
        }
    }

    /// Wait for the reader task to exit, it must have been cancelled first
    pub async fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(reader = self.id, "Partition reader panicked: {e:#}");
            }
        }
    }

    async fn run(
        id: usize,
        mut positions: Vec<PartitionPosition>,
        distributor: Distributor,
        context: ReaderContext,
    ) {
        if positions.is_empty() {
            debug!(reader = id, "No partitions assigned, reader idle");
            context.cancel.cancelled().await;
            return;
        }

        info!(
            reader = id,
            topic = context.topic,
            partitions = ?positions.iter().map(|p| p.partition).collect::<Vec<_>>(),
            grouping = %distributor.policy(),
            "Partition reader started"
        );

        loop {
            let mut fetched_any = false;

            for position in positions.iter_mut() {
                if context.cancel.is_cancelled() {
                    return;
                }

                let messages = match Self::fetch(id, position, &context).await {
                    Some(Ok(messages)) => messages,
                    Some(Err(e)) => {
                        error!(reader = id, partition = position.partition, "Reader stopping: {e:#}");
                        if context.fatal_errors.send(e).is_err() {
                            debug!(reader = id, "Pipeline already stopping");
                        }
                        return;
                    }
                    None => return,
                };

                if messages.is_empty() {
                    continue;
                }
                fetched_any = true;
                metrics::counter!(SOURCE_MESSAGES_FETCHED).increment(messages.len() as u64);

                for message in messages {
                    if message.offset() < position.next_offset {
                        continue;
                    }
                    let offset = message.offset();

                    match Self::hand_over(message, &distributor, &context).await {
                        Handover::Delivered => position.next_offset = offset + 1,
                        Handover::Cancelled => return,
                        Handover::Closed => {
                            let error = PipelineError::Fatal(format!(
                                "handler queue closed while delivering partition {} offset {offset}",
                                position.partition
                            ));
                            error!(reader = id, "Reader stopping: {error:#}");
                            if context.fatal_errors.send(error).is_err() {
                                debug!(reader = id, "Pipeline already stopping");
                            }
                            return;
                        }
                    }
                }
            }

            if !fetched_any {
                tokio::select! {
                    _ = context.cancel.cancelled() => return,
                    _ = tokio::time::sleep(context.poll_interval) => {}
                }
            }
        }
    }

    /// Fetch the next batch, retrying transient failures. None when cancelled.
    async fn fetch(
        id: usize,
        position: &PartitionPosition,
        context: &ReaderContext,
    ) -> Option<Result<Vec<Message>, PipelineError>> {
        let fetch = retry_transient(
            &context.retry_policy,
            context.io_max_retries,
            "fetching from log",
            |e: &FetchError| {
                let kind = match e {
                    FetchError::Transient(_) => "transient",
                    FetchError::Permanent(_) => "permanent",
                };
                metrics::counter!(SOURCE_FETCH_ERRORS, "kind" => kind).increment(1);
                matches!(e, FetchError::Transient(_))
            },
            || {
                context.log.fetch(
                    &context.topic,
                    position.partition,
                    position.next_offset,
                    context.fetch_batch_size,
                )
            },
        );

        let result = tokio::select! {
            _ = context.cancel.cancelled() => return None,
            result = fetch => result,
        };

        Some(result.map_err(|exhausted| {
            debug!(
                reader = id,
                partition = position.partition,
                attempts = exhausted.attempts,
                "Fetch gave up"
            );
            PipelineError::from(exhausted)
        }))
    }

    async fn hand_over(message: Message, distributor: &Distributor, context: &ReaderContext) -> Handover {
        let permit = match context.in_flight.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                metrics::counter!(SOURCE_BACKPRESSURE_TOTAL).increment(1);
                debug!(
                    partition = message.partition(),
                    offset = message.offset(),
                    "In-flight limit reached, waiting for handlers"
                );
                tokio::select! {
                    _ = context.cancel.cancelled() => return Handover::Cancelled,
                    permit = context.in_flight.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return Handover::Closed,
                    },
                }
            }
        };

        let instance = distributor.route(&message);
        let Some(sender) = context.handlers.get(instance) else {
            return Handover::Closed;
        };

        let partition = message.partition();
        let offset = message.offset();
        if !context.tracker.track(partition, offset) {
            // Already handed over in this run
            return Handover::Delivered;
        }

        tokio::select! {
            _ = context.cancel.cancelled() => {
                // Never reached a handler, the next run reads it again
                Handover::Cancelled
            }
            sent = sender.send(Delivery::new(message, permit)) => match sent {
                Ok(()) => Handover::Delivered,
                Err(_) => Handover::Closed,
            },
        }
    }
}
