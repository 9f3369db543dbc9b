//! Offset Tracker - Tracks delivered and acknowledged offsets per partition
//!
//! Messages are registered with the tracker when they are handed to a handler
//! and released when they reach a terminal outcome. Acknowledgments may arrive
//! in any order, but the processed position of a partition only moves over a
//! contiguous prefix of the delivered offsets, so the durable cursor never
//! skips a message that is still in flight.
//!
//! Durable commits go through a [`CursorStore`] and are serialized per
//! partition, one writer at a time. Reads of the committed cursors never block
//! on the store.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cursor_store::CursorStore;
use crate::error::{PipelineError, StoreError};
use crate::metrics_consts::{DUPLICATE_ACKS, OUT_OF_ORDER_ACKS, PARTITION_LAST_COMMITTED_OFFSET};
use crate::retry::{retry_transient, RetryPolicy};
use crate::types::Cursor;

/// Result of acknowledging a single offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The processed position moved forward to the given offset
    Advanced(i64),
    /// Recorded, but an earlier delivered offset is still in flight
    Pending,
    /// The offset was already acknowledged or is behind the processed position
    Duplicate,
    /// The offset was never delivered in this run
    Untracked,
}

/// Result of a durable commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(i64),
    /// The requested offset is not ahead of the stored cursor
    Unchanged,
}

#[derive(Default)]
struct PartitionState {
    /// Delivered offsets in delivery order, paired with their ack flag
    in_flight: VecDeque<(i64, bool)>,
    /// Highest offset such that it and every delivered offset before it are done
    processed: Option<i64>,
    /// Last durably committed offset
    committed: Option<i64>,
}

pub struct OffsetTracker {
    source_id: String,
    store: Arc<dyn CursorStore>,
    partitions: DashMap<i32, PartitionState>,
    /// Single-writer-per-partition locks for durable commits
    commit_locks: DashMap<i32, Arc<Mutex<()>>>,
    retry_policy: RetryPolicy,
    io_max_retries: u32,
}

impl OffsetTracker {
    pub fn new(source_id: impl Into<String>, store: Arc<dyn CursorStore>) -> Self {
        Self {
            source_id: source_id.into(),
            store,
            partitions: DashMap::new(),
            commit_locks: DashMap::new(),
            retry_policy: RetryPolicy::default(),
            io_max_retries: 5,
        }
    }

    /// Configure how store errors are retried before they are escalated
    pub fn with_retries(mut self, retry_policy: RetryPolicy, io_max_retries: u32) -> Self {
        self.retry_policy = retry_policy;
        self.io_max_retries = io_max_retries.max(1);
        self
    }

    fn commit_lock(&self, partition: i32) -> Arc<Mutex<()>> {
        self.commit_locks
            .entry(partition)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn store_error(&self, error: StoreError, attempts: u32) -> PipelineError {
        match error {
            StoreError::Io(e) => PipelineError::TransientIo {
                component: "cursor store",
                attempts,
                reason: e.to_string(),
            },
            StoreError::Corrupt(e) => PipelineError::Fatal(format!(
                "cursor store for '{}' is corrupt: {e}",
                self.source_id
            )),
        }
    }

    /// The last durably committed offset for a partition, loading it from the
    /// store the first time a partition is seen.
    pub async fn last_committed(&self, partition: i32) -> Result<Option<i64>, PipelineError> {
        if let Some(state) = self.partitions.get(&partition) {
            if state.committed.is_some() {
                return Ok(state.committed);
            }
        }

        let lock = self.commit_lock(partition);
        let _guard = lock.lock().await;
        self.load_committed(partition).await
    }

    /// Load the stored cursor into the partition state. Callers hold the
    /// partition's commit lock.
    async fn load_committed(&self, partition: i32) -> Result<Option<i64>, PipelineError> {
        let loaded = retry_transient(
            &self.retry_policy,
            self.io_max_retries,
            "loading cursor",
            |e: &StoreError| matches!(e, StoreError::Io(_)),
            || self.store.load(&self.source_id, partition),
        )
        .await
        .map_err(|exhausted| self.store_error(exhausted.error, exhausted.attempts))?;

        let mut state = self.partitions.entry(partition).or_default();
        if state.committed.is_none() {
            state.committed = loaded;
        }
        if state.processed < state.committed {
            state.processed = state.committed;
        }
        Ok(state.committed)
    }

    /// Durably record that every message up to and including `offset` is
    /// processed. Committing an offset that is not ahead of the stored cursor
    /// is a no-op.
    pub async fn commit(&self, partition: i32, offset: i64) -> Result<CommitOutcome, PipelineError> {
        let lock = self.commit_lock(partition);
        let _guard = lock.lock().await;

        let current = match self.partitions.get(&partition).and_then(|s| s.committed) {
            Some(current) => Some(current),
            // Never compare against an unloaded partition, the store may be ahead
            None => self.load_committed(partition).await?,
        };
        if let Some(current) = current {
            if offset <= current {
                debug!(
                    source_id = self.source_id,
                    partition = partition,
                    offset = offset,
                    committed = current,
                    "Commit not ahead of stored cursor, ignoring"
                );
                return Ok(CommitOutcome::Unchanged);
            }
        }

        let cursor = Cursor::new(self.source_id.clone(), partition, offset);
        retry_transient(
            &self.retry_policy,
            self.io_max_retries,
            "saving cursor",
            |e: &StoreError| matches!(e, StoreError::Io(_)),
            || self.store.save(&cursor),
        )
        .await
        .map_err(|exhausted| self.store_error(exhausted.error, exhausted.attempts))?;

        let mut state = self.partitions.entry(partition).or_default();
        state.committed = Some(offset);
        if state.processed < state.committed {
            state.processed = state.committed;
        }
        drop(state);

        metrics::gauge!(
            PARTITION_LAST_COMMITTED_OFFSET,
            "partition" => partition.to_string()
        )
        .set(offset as f64);
        debug!(
            source_id = self.source_id,
            partition = partition,
            offset = offset,
            "Committed cursor"
        );

        Ok(CommitOutcome::Committed(offset))
    }

    /// Register a message handed to a handler. Offsets must be registered in
    /// increasing order per partition; anything else is rejected.
    pub fn track(&self, partition: i32, offset: i64) -> bool {
        let mut state = self.partitions.entry(partition).or_default();
        if let Some((last, _)) = state.in_flight.back().copied() {
            if offset <= last {
                warn!(
                    partition = partition,
                    offset = offset,
                    last_tracked = last,
                    "Refusing to track offset delivered out of order"
                );
                return false;
            }
        }
        state.in_flight.push_back((offset, false));
        true
    }

    /// Record the terminal outcome of a delivered message.
    ///
    /// The processed position advances only when the acknowledged offset is
    /// the oldest one still in flight, and then also over every younger offset
    /// that was already acknowledged.
    pub fn acknowledge(&self, partition: i32, offset: i64) -> AckOutcome {
        let Some(mut state) = self.partitions.get_mut(&partition) else {
            warn!(partition = partition, offset = offset, "Ack for unknown partition");
            return AckOutcome::Untracked;
        };

        let position = state
            .in_flight
            .binary_search_by_key(&offset, |(o, _)| *o);

        let Ok(index) = position else {
            if state.processed.is_some_and(|p| offset <= p) {
                // Superseded by a higher processed offset, e.g. a redelivery
                debug!(
                    partition = partition,
                    offset = offset,
                    processed = ?state.processed,
                    "Ack for already processed offset"
                );
                metrics::counter!(DUPLICATE_ACKS).increment(1);
                return AckOutcome::Duplicate;
            }
            warn!(partition = partition, offset = offset, "Ack for offset that was never delivered");
            return AckOutcome::Untracked;
        };

        if state.in_flight[index].1 {
            warn!(partition = partition, offset = offset, "Message acknowledged twice");
            metrics::counter!(DUPLICATE_ACKS).increment(1);
            return AckOutcome::Duplicate;
        }
        state.in_flight[index].1 = true;

        if index != 0 {
            debug!(
                partition = partition,
                offset = offset,
                waiting_on = state.in_flight[0].0,
                "Out of order ack, holding until earlier offsets complete"
            );
            metrics::counter!(OUT_OF_ORDER_ACKS).increment(1);
            return AckOutcome::Pending;
        }

        let mut advanced_to = offset;
        while let Some((front, true)) = state.in_flight.front().copied() {
            advanced_to = front;
            state.in_flight.pop_front();
        }
        if state.processed.is_some_and(|p| advanced_to <= p) {
            // Replay of offsets the cursor already covers
            metrics::counter!(DUPLICATE_ACKS).increment(1);
            return AckOutcome::Duplicate;
        }
        state.processed = Some(advanced_to);

        AckOutcome::Advanced(advanced_to)
    }

    /// Highest contiguously processed offset, which is what the next commit will store
    pub fn processed_offset(&self, partition: i32) -> Option<i64> {
        self.partitions.get(&partition).and_then(|s| s.processed)
    }

    /// Last durably committed offset known to this tracker, without touching the store
    pub fn committed_offset(&self, partition: i32) -> Option<i64> {
        self.partitions.get(&partition).and_then(|s| s.committed)
    }

    /// Number of delivered messages without a terminal outcome
    pub fn in_flight_count(&self) -> usize {
        self.partitions
            .iter()
            .map(|entry| entry.in_flight.iter().filter(|(_, acked)| !acked).count())
            .sum()
    }

    /// Commit every partition whose processed position is ahead of its cursor
    pub async fn flush(&self) -> Result<Vec<Cursor>, PipelineError> {
        let pending: Vec<(i32, i64)> = self
            .partitions
            .iter()
            .filter_map(|entry| match (entry.processed, entry.committed) {
                (Some(processed), Some(committed)) if processed > committed => {
                    Some((*entry.key(), processed))
                }
                (Some(processed), None) => Some((*entry.key(), processed)),
                _ => None,
            })
            .collect();

        let mut committed = Vec::with_capacity(pending.len());
        for (partition, offset) in pending {
            if let CommitOutcome::Committed(offset) = self.commit(partition, offset).await? {
                committed.push(Cursor::new(self.source_id.clone(), partition, offset));
            }
        }
        Ok(committed)
    }

    /// Snapshot of the committed cursors, sorted by partition
    pub fn cursors(&self) -> Vec<Cursor> {
        let mut cursors: Vec<Cursor> = self
            .partitions
            .iter()
            .filter_map(|entry| {
                entry
                    .committed
                    .map(|offset| Cursor::new(self.source_id.clone(), *entry.key(), offset))
            })
            .collect();
        cursors.sort_by_key(|c| c.partition);
        cursors
    }

    /// Forget in-flight deliveries, keeping the committed cursors. Unacked
    /// messages will be delivered again by the next run.
    pub fn reset_in_flight(&self) {
        let mut dropped = 0;
        for mut entry in self.partitions.iter_mut() {
            dropped += entry.in_flight.iter().filter(|(_, acked)| !acked).count();
            entry.in_flight.clear();
            entry.processed = entry.committed;
        }
        if dropped > 0 {
            info!(
                source_id = self.source_id,
                dropped = dropped,
                "Discarded unacknowledged deliveries, they will be redelivered"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor_store::MemoryCursorStore;

    fn tracker() -> (OffsetTracker, Arc<MemoryCursorStore>) {
        let store = Arc::new(MemoryCursorStore::new());
        (OffsetTracker::new("test-source", store.clone()), store)
    }

    #[tokio::test]
    async fn test_in_order_acks_advance() {
        let (tracker, _) = tracker();
        tracker.track(0, 0);
        tracker.track(0, 1);

        assert_eq!(tracker.acknowledge(0, 0), AckOutcome::Advanced(0));
        assert_eq!(tracker.acknowledge(0, 1), AckOutcome::Advanced(1));
        assert_eq!(tracker.processed_offset(0), Some(1));
        assert_eq!(tracker.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_acks_wait_for_gap() {
        let (tracker, store) = tracker();
        store.seed("test-source", 0, 2).await;
        assert_eq!(tracker.last_committed(0).await.unwrap(), Some(2));

        for offset in 3..=5 {
            assert!(tracker.track(0, offset));
        }

        assert_eq!(tracker.acknowledge(0, 5), AckOutcome::Pending);
        assert_eq!(tracker.processed_offset(0), Some(2));

        assert_eq!(tracker.acknowledge(0, 3), AckOutcome::Advanced(3));
        assert_eq!(tracker.processed_offset(0), Some(3));

        assert_eq!(tracker.acknowledge(0, 4), AckOutcome::Advanced(5));
        assert_eq!(tracker.processed_offset(0), Some(5));

        tracker.flush().await.unwrap();
        assert_eq!(store.load("test-source", 0).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_double_ack_is_noop() {
        let (tracker, _) = tracker();
        tracker.track(0, 10);
        tracker.track(0, 11);

        assert_eq!(tracker.acknowledge(0, 11), AckOutcome::Pending);
        assert_eq!(tracker.acknowledge(0, 11), AckOutcome::Duplicate);
        assert_eq!(tracker.acknowledge(0, 10), AckOutcome::Advanced(11));
        assert_eq!(tracker.acknowledge(0, 10), AckOutcome::Duplicate);
        assert_eq!(tracker.processed_offset(0), Some(11));
    }

    #[tokio::test]
    async fn test_ack_for_untracked_offset() {
        let (tracker, _) = tracker();
        assert_eq!(tracker.acknowledge(3, 1), AckOutcome::Untracked);

        tracker.track(0, 5);
        assert_eq!(tracker.acknowledge(0, 7), AckOutcome::Untracked);
    }

    #[tokio::test]
    async fn test_track_rejects_regressing_offsets() {
        let (tracker, _) = tracker();
        assert!(tracker.track(0, 5));
        assert!(!tracker.track(0, 5));
        assert!(!tracker.track(0, 4));
        assert!(tracker.track(0, 9));
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let (tracker, store) = tracker();

        assert_eq!(tracker.commit(0, 7).await.unwrap(), CommitOutcome::Committed(7));
        assert_eq!(tracker.commit(0, 7).await.unwrap(), CommitOutcome::Unchanged);
        assert_eq!(store.load("test-source", 0).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_commit_never_decreases() {
        let (tracker, store) = tracker();

        tracker.commit(0, 100).await.unwrap();
        assert_eq!(tracker.commit(0, 50).await.unwrap(), CommitOutcome::Unchanged);
        assert_eq!(tracker.committed_offset(0), Some(100));
        assert_eq!(store.load("test-source", 0).await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_commit_checks_stored_cursor_of_unloaded_partition() {
        let (tracker, store) = tracker();
        store.seed("test-source", 0, 10).await;

        assert_eq!(tracker.commit(0, 5).await.unwrap(), CommitOutcome::Unchanged);
        assert_eq!(tracker.commit(0, 10).await.unwrap(), CommitOutcome::Unchanged);
        assert_eq!(tracker.committed_offset(0), Some(10));
        assert_eq!(store.load("test-source", 0).await.unwrap(), Some(10));

        assert_eq!(tracker.commit(0, 11).await.unwrap(), CommitOutcome::Committed(11));
    }

    #[tokio::test]
    async fn test_flush_only_commits_advanced_partitions() {
        let (tracker, _) = tracker();
        tracker.commit(1, 20).await.unwrap();
        tracker.track(0, 0);
        tracker.acknowledge(0, 0);

        let committed = tracker.flush().await.unwrap();
        assert_eq!(committed, vec![Cursor::new("test-source", 0, 0)]);

        let committed = tracker.flush().await.unwrap();
        assert!(committed.is_empty());
        assert_eq!(
            tracker.cursors(),
            vec![
                Cursor::new("test-source", 0, 0),
                Cursor::new("test-source", 1, 20)
            ]
        );
    }

    #[tokio::test]
    async fn test_reset_in_flight_rewinds_to_committed() {
        let (tracker, _) = tracker();
        tracker.commit(0, 4).await.unwrap();
        tracker.track(0, 5);
        tracker.track(0, 6);
        tracker.acknowledge(0, 6);

        assert_eq!(tracker.in_flight_count(), 1);
        tracker.reset_in_flight();

        assert_eq!(tracker.in_flight_count(), 0);
        assert_eq!(tracker.processed_offset(0), Some(4));
        assert!(tracker.track(0, 5));
    }

    #[tokio::test]
    async fn test_concurrent_acks_same_partition() {
        let (tracker, _) = tracker();
        let tracker = Arc::new(tracker);
        for offset in 0..100 {
            tracker.track(0, offset);
        }

        let mut handles = vec![];
        for offset in (0..100).rev() {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move { tracker.acknowledge(0, offset) }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(tracker.processed_offset(0), Some(99));
        assert_eq!(tracker.in_flight_count(), 0);
    }
}
