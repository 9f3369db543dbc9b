//! Pipeline Driver - Wires readers, distributor and handler instances
//!
//! A run is started with [`Pipeline::start`] and ended with
//! [`Pipeline::stop`], which shuts down in order: readers first, then the
//! handler instances drain their queues (bounded by the grace period), then
//! every processed position is committed. Messages without a terminal outcome
//! are not committed and are delivered again by the next run.
//!
//! Handlers still busy when the grace period elapses are not treated as
//! failed: their messages are abandoned without being dead-lettered or
//! acknowledged, and the next run delivers them again.
//!
//! The `earliest` and `latest` resume policies only pick where the first run
//! of a [`Pipeline`] starts. Every later run, after [`Pipeline::restart`] or a
//! supervised restart, continues from the committed cursor so nothing the
//! previous run left unfinished is skipped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{PipelineConfig, ResumePolicy};
use crate::cursor_store::CursorStore;
use crate::dead_letter::DeadLetterSink;
use crate::distributor::{Distributor, Placement};
use crate::error::{FetchError, PipelineError};
use crate::handler::{DeliveryStats, HandlerContext, HandlerFactory, HandlerInstance, InstanceDeps};
use crate::offset_tracker::OffsetTracker;
use crate::retry::retry_transient;
use crate::source::{assign_partitions, LogReader, PartitionReader, ReaderContext, Watermarks};
use crate::types::Cursor;

/// External collaborators of a pipeline
#[derive(Clone)]
pub struct PipelineComponents {
    pub log: Arc<dyn LogReader>,
    pub cursor_store: Arc<dyn CursorStore>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub handlers: Arc<dyn HandlerFactory>,
}

/// Outcome of one run, returned by [`Pipeline::stop`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub acked: u64,
    pub dead_lettered: u64,
    /// Deliveries cut short by the grace period or a failing dead-letter sink
    pub abandoned: u64,
    pub cursors: Vec<Cursor>,
}

struct RunningPipeline {
    cancel: CancellationToken,
    grace_expired: CancellationToken,
    readers: Vec<PartitionReader>,
    instances: Vec<HandlerInstance>,
    committer: JoinHandle<()>,
    stats: Arc<DeliveryStats>,
    fatal_rx: mpsc::UnboundedReceiver<PipelineError>,
    // Keeps the channel open while the run lasts
    _fatal_tx: mpsc::UnboundedSender<PipelineError>,
}

enum Event {
    Shutdown,
    Fatal(PipelineError),
}

pub struct Pipeline {
    config: PipelineConfig,
    components: PipelineComponents,
    tracker: Arc<OffsetTracker>,
    running: Option<RunningPipeline>,
    /// Where the first run started reading each partition
    first_positions: HashMap<i32, i64>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, components: PipelineComponents) -> Result<Self, PipelineError> {
        config.validate()?;

        let tracker = OffsetTracker::new(config.source_id.clone(), components.cursor_store.clone())
            .with_retries(config.retry_policy.clone(), config.io_max_retries);

        Ok(Self {
            config,
            components,
            tracker: Arc::new(tracker),
            running: None,
            first_positions: HashMap::new(),
        })
    }

    pub fn tracker(&self) -> &Arc<OffsetTracker> {
        &self.tracker
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Committed cursors of this pipeline, sorted by partition
    pub fn cursors(&self) -> Vec<Cursor> {
        self.tracker.cursors()
    }

    /// Partitions this pipeline reads, checked against the topic
    async fn resolve_partitions(&self) -> Result<Vec<i32>, PipelineError> {
        let available = retry_transient(
            &self.config.retry_policy,
            self.config.io_max_retries,
            "listing partitions",
            |e: &FetchError| matches!(e, FetchError::Transient(_)),
            || self.components.log.partitions(&self.config.topic),
        )
        .await?;

        let Some(configured) = &self.config.partitions else {
            return Ok(available);
        };

        for partition in configured {
            if !available.contains(partition) {
                return Err(PipelineError::PermanentConfig(format!(
                    "partition {partition} does not exist in topic '{}'",
                    self.config.topic
                )));
            }
        }
        let mut partitions = configured.clone();
        partitions.sort_unstable();
        partitions.dedup();
        Ok(partitions)
    }

    async fn watermarks(&self, partition: i32) -> Result<Watermarks, PipelineError> {
        retry_transient(
            &self.config.retry_policy,
            self.config.io_max_retries,
            "fetching watermarks",
            |e: &FetchError| matches!(e, FetchError::Transient(_)),
            || self.components.log.watermarks(&self.config.topic, partition),
        )
        .await
        .map_err(PipelineError::from)
    }

    /// First offset to read in a partition under the configured resume policy
    async fn resume_position(&self, partition: i32) -> Result<i64, PipelineError> {
        let watermarks = self.watermarks(partition).await?;

        let policy_position = |policy: ResumePolicy| match policy {
            ResumePolicy::Earliest => watermarks.low,
            _ => watermarks.high,
        };

        // Loaded for every policy, so replays never move a stored cursor back
        let committed = self.tracker.last_committed(partition).await?;

        let position = match (self.first_positions.get(&partition), self.config.resume_policy) {
            // Later runs pick up where the previous one committed, but never
            // before where the first run started
            (Some(first), _) => committed.map_or(*first, |committed| (committed + 1).max(*first)),
            (None, ResumePolicy::Stored) => match committed {
                Some(committed) => committed + 1,
                None => policy_position(self.config.default_resume_policy),
            },
            (None, policy) => policy_position(policy),
        };

        if position < watermarks.low {
            warn!(
                partition = partition,
                resume_offset = position,
                low_watermark = watermarks.low,
                "Resume position no longer retained, starting at oldest retained offset"
            );
            return Ok(watermarks.low);
        }

        Ok(position)
    }

    /// Start a run: resolve partitions and resume positions, then spawn the
    /// handler instances, the readers and the periodic committer.
    pub async fn start(&mut self) -> Result<(), PipelineError> {
        if self.running.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        let partitions = self.resolve_partitions().await?;
        let mut positions = Vec::with_capacity(partitions.len());
        for partition in &partitions {
            positions.push((*partition, self.resume_position(*partition).await?));
        }
        for (partition, position) in &positions {
            self.first_positions.entry(*partition).or_insert(*position);
        }

        let config = &self.config;
        let cancel = CancellationToken::new();
        let grace_expired = CancellationToken::new();
        let stats = Arc::new(DeliveryStats::default());
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let placement = Placement::new(config.workers, config.handler_instances);

        let deps = Arc::new(InstanceDeps {
            tracker: self.tracker.clone(),
            dead_letters: self.components.dead_letters.clone(),
            max_retries: config.max_retries,
            retry_policy: config.retry_policy.clone(),
            io_max_retries: config.io_max_retries,
            handler_timeout: config.handler_timeout,
            grace_expired: grace_expired.clone(),
            fatal_errors: fatal_tx.clone(),
            stats: stats.clone(),
        });

        let instances: Vec<HandlerInstance> = (0..config.handler_instances)
            .map(|instance| {
                let context = HandlerContext {
                    instance,
                    worker: placement.worker_of_instance(instance),
                    instances: config.handler_instances,
                };
                let handler = self.components.handlers.create(&context);
                HandlerInstance::spawn(context, handler, deps.clone(), config.handler_queue_capacity)
            })
            .collect();

        let reader_context = ReaderContext {
            topic: config.topic.clone(),
            log: self.components.log.clone(),
            tracker: self.tracker.clone(),
            handlers: instances.iter().map(HandlerInstance::sender).collect(),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight_messages)),
            fetch_batch_size: config.fetch_batch_size,
            poll_interval: config.poll_interval,
            retry_policy: config.retry_policy.clone(),
            io_max_retries: config.io_max_retries,
            cancel: cancel.clone(),
            fatal_errors: fatal_tx.clone(),
        };

        let assignments = assign_partitions(&partitions, config.source_parallelism);
        let readers: Vec<PartitionReader> = assignments
            .into_iter()
            .enumerate()
            .map(|(reader, owned)| {
                let reader_positions = positions
                    .iter()
                    .filter(|(partition, _)| owned.contains(partition))
                    .copied()
                    .collect();
                let distributor = Distributor::new(
                    config.grouping_policy,
                    config.handler_instances,
                    &placement,
                    placement.worker_of_reader(reader),
                );
                PartitionReader::spawn(reader, reader_positions, distributor, reader_context.clone())
            })
            .collect();
        drop(reader_context);

        let committer = tokio::spawn(Self::run_committer(
            self.tracker.clone(),
            config.commit_interval,
            cancel.clone(),
            fatal_tx.clone(),
        ));

        info!(
            topic = config.topic,
            source_id = config.source_id,
            partitions = ?positions,
            readers = config.source_parallelism,
            handler_instances = config.handler_instances,
            grouping = %config.grouping_policy,
            "Pipeline started"
        );

        self.running = Some(RunningPipeline {
            cancel,
            grace_expired,
            readers,
            instances,
            committer,
            stats,
            fatal_rx,
            _fatal_tx: fatal_tx,
        });
        Ok(())
    }

    /// Periodically persist processed positions while the run lasts
    async fn run_committer(
        tracker: Arc<OffsetTracker>,
        interval: std::time::Duration,
        cancel: CancellationToken,
        fatal_errors: mpsc::UnboundedSender<PipelineError>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match tracker.flush().await {
                Ok(committed) if !committed.is_empty() => {
                    debug!(cursors = ?committed, "Periodic commit");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Periodic commit failed: {e:#}");
                    if fatal_errors.send(e).is_err() {
                        debug!("Pipeline already stopping");
                    }
                    return;
                }
            }
        }
    }

    /// Orderly shutdown: stop reading, drain handlers within the grace
    /// period, then commit everything that finished.
    pub async fn stop(&mut self) -> Result<StopReport, PipelineError> {
        let Some(running) = self.running.take() else {
            return Err(PipelineError::NotRunning);
        };

        info!(source_id = self.config.source_id, "Stopping pipeline");
        running.cancel.cancel();
        join_all(running.readers.into_iter().map(PartitionReader::join)).await;
        debug!("Partition readers stopped");

        let drain = join_all(running.instances.into_iter().map(HandlerInstance::shutdown));
        tokio::pin!(drain);
        if tokio::time::timeout(self.config.shutdown_grace_period, &mut drain)
            .await
            .is_err()
        {
            warn!(
                grace_period_ms = self.config.shutdown_grace_period.as_millis() as u64,
                in_flight = self.tracker.in_flight_count(),
                "Shutdown grace period elapsed, abandoning in-flight messages"
            );
            running.grace_expired.cancel();
            drain.await;
        }

        if let Err(e) = running.committer.await {
            warn!("Committer task panicked: {e:#}");
        }

        let flushed = self.tracker.flush().await;
        self.tracker.reset_in_flight();
        flushed?;

        let report = StopReport {
            acked: running.stats.acked(),
            dead_lettered: running.stats.dead_lettered(),
            abandoned: running.stats.abandoned(),
            cursors: self.tracker.cursors(),
        };
        info!(
            acked = report.acked,
            dead_lettered = report.dead_lettered,
            abandoned = report.abandoned,
            cursors = ?report.cursors,
            "Pipeline stopped"
        );
        Ok(report)
    }

    /// Stop, then start again with the same configuration, resuming from the
    /// committed cursors
    pub async fn restart(&mut self) -> Result<StopReport, PipelineError> {
        let report = self.stop().await?;
        self.start().await?;
        Ok(report)
    }

    /// Wait for the next fatal error of the current run. Pending forever when
    /// the pipeline is not running.
    pub async fn next_fatal_error(&mut self) -> PipelineError {
        match self.running.as_mut() {
            Some(running) => match running.fatal_rx.recv().await {
                Some(error) => error,
                None => PipelineError::Fatal("fatal error channel closed".to_string()),
            },
            None => std::future::pending().await,
        }
    }

    /// A fatal error the current run has already reported, without waiting
    pub fn take_fatal_error(&mut self) -> Option<PipelineError> {
        self.running.as_mut()?.fatal_rx.try_recv().ok()
    }

    /// Run until `shutdown` completes or a fatal error occurs. Errors that may
    /// clear on their own (exhausted transient I/O) restart the whole pipeline
    /// up to the configured number of times, every other error stops it.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<StopReport, PipelineError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut restarts = 0;

        loop {
            if !self.is_running() {
                if let Err(e) = self.start().await {
                    if !e.is_retryable() || restarts >= self.config.max_restarts {
                        return Err(e);
                    }
                    restarts += 1;
                    if !self.backoff(restarts, &e, &mut shutdown).await {
                        return Err(e);
                    }
                    continue;
                }
            }

            let event = tokio::select! {
                _ = &mut shutdown => Event::Shutdown,
                error = self.next_fatal_error() => Event::Fatal(error),
            };

            let error = match event {
                Event::Shutdown => {
                    info!("Shutdown requested");
                    return self.stop().await;
                }
                Event::Fatal(error) => error,
            };

            error!(category = %error.category(), "Pipeline failed: {error:#}");
            if let Err(stop_error) = self.stop().await {
                error!("Pipeline did not stop cleanly: {stop_error:#}");
            }

            if !error.is_retryable() || restarts >= self.config.max_restarts {
                return Err(error);
            }
            restarts += 1;
            if !self.backoff(restarts, &error, &mut shutdown).await {
                return Err(error);
            }
        }
    }

    /// Sleep before restart number `restarts`. False when shutdown was
    /// requested meanwhile.
    async fn backoff<F>(&self, restarts: u32, error: &PipelineError, shutdown: &mut std::pin::Pin<&mut F>) -> bool
    where
        F: Future<Output = ()>,
    {
        let delay = self.config.retry_policy.retry_interval(restarts);
        warn!(
            restart = restarts,
            max_restarts = self.config.max_restarts,
            delay_ms = delay.as_millis() as u64,
            "Restarting pipeline after: {}",
            error
        );
        tokio::select! {
            _ = shutdown.as_mut() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor_store::MemoryCursorStore;
    use crate::dead_letter::MemoryDeadLetterSink;
    use crate::handler::MatchCountHandler;
    use crate::source::MemoryLog;
    use std::time::Duration;

    fn components(log: Arc<MemoryLog>, store: Arc<MemoryCursorStore>) -> PipelineComponents {
        PipelineComponents {
            log,
            cursor_store: store,
            dead_letters: Arc::new(MemoryDeadLetterSink::new()),
            handlers: Arc::new(MatchCountHandler::factory("Hello World")),
        }
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::new("Messaging", "spout");
        config.poll_interval = Duration::from_millis(5);
        config.commit_interval = Duration::from_millis(10);
        config
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let log = Arc::new(MemoryLog::new("Messaging", 1));
        let mut pipeline =
            Pipeline::new(config(), components(log, Arc::new(MemoryCursorStore::new()))).unwrap();

        pipeline.start().await.unwrap();
        assert!(matches!(
            pipeline.start().await,
            Err(PipelineError::AlreadyRunning)
        ));
        pipeline.stop().await.unwrap();
        assert!(matches!(
            pipeline.stop().await,
            Err(PipelineError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_stored_resume_falls_back_to_default_policy() {
        let log = Arc::new(MemoryLog::new("Messaging", 2));
        log.append(0, "old");
        let store = Arc::new(MemoryCursorStore::new());
        store.seed("spout", 1, 0).await;
        log.append(1, "a");
        log.append(1, "b");

        let mut config = config();
        config.default_resume_policy = ResumePolicy::Earliest;
        let pipeline = Pipeline::new(config, components(log, store)).unwrap();

        assert_eq!(pipeline.resume_position(0).await.unwrap(), 0);
        assert_eq!(pipeline.resume_position(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resume_position_clamped_to_retention() {
        let log = Arc::new(MemoryLog::new("Messaging", 1));
        for i in 0..10 {
            log.append(0, format!("m{i}"));
        }
        log.truncate_before(0, 6);
        let store = Arc::new(MemoryCursorStore::new());
        store.seed("spout", 0, 2).await;

        let pipeline = Pipeline::new(config(), components(log, store)).unwrap();
        assert_eq!(pipeline.resume_position(0).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_unknown_configured_partition_is_permanent() {
        let log = Arc::new(MemoryLog::new("Messaging", 2));
        let mut config = config();
        config.partitions = Some(vec![0, 5]);
        let mut pipeline =
            Pipeline::new(config, components(log, Arc::new(MemoryCursorStore::new()))).unwrap();

        let error = pipeline.start().await.unwrap_err();
        assert!(matches!(error, PipelineError::PermanentConfig(_)));
        assert!(!pipeline.is_running());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let log = Arc::new(MemoryLog::new("Messaging", 1));
        let mut config = config();
        config.source_parallelism = 0;

        assert!(matches!(
            Pipeline::new(config, components(log, Arc::new(MemoryCursorStore::new()))),
            Err(PipelineError::PermanentConfig(_))
        ));
    }
}
