use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::error::FetchError;
use crate::source::log::{LogReader, Watermarks};
use crate::types::Message;

struct PartitionLog {
    /// Offset of the first retained message
    low: i64,
    messages: VecDeque<Message>,
}

impl PartitionLog {
    fn high(&self) -> i64 {
        self.low + self.messages.len() as i64
    }
}

/// In-process log with a single topic, used to embed the pipeline and in tests
pub struct MemoryLog {
    topic: String,
    partitions: DashMap<i32, PartitionLog>,
    /// Number of upcoming fetches that fail with a transient error
    failing_fetches: AtomicU32,
}

impl MemoryLog {
    pub fn new(topic: impl Into<String>, partitions: i32) -> Self {
        Self::with_base_offset(topic, partitions, 0)
    }

    /// A log whose partitions start at `base_offset`, as if older messages had
    /// been removed by retention
    pub fn with_base_offset(topic: impl Into<String>, partitions: i32, base_offset: i64) -> Self {
        let logs = DashMap::new();
        for partition in 0..partitions {
            logs.insert(
                partition,
                PartitionLog {
                    low: base_offset,
                    messages: VecDeque::new(),
                },
            );
        }
        Self {
            topic: topic.into(),
            partitions: logs,
            failing_fetches: AtomicU32::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append a message and return its offset, or None for an unknown partition
    pub fn append(&self, partition: i32, payload: impl Into<Bytes>) -> Option<i64> {
        let mut log = self.partitions.get_mut(&partition)?;
        let offset = log.high();
        log.messages
            .push_back(Message::new(partition, offset, payload));
        Some(offset)
    }

    /// Drop every message below `offset`, like log retention would
    pub fn truncate_before(&self, partition: i32, offset: i64) {
        if let Some(mut log) = self.partitions.get_mut(&partition) {
            while log.low < offset && !log.messages.is_empty() {
                log.messages.pop_front();
                log.low += 1;
            }
        }
    }

    /// Make the next `count` fetches fail with a transient error
    pub fn fail_next_fetches(&self, count: u32) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    fn check_topic(&self, topic: &str) -> Result<(), FetchError> {
        if topic != self.topic {
            return Err(FetchError::Permanent(format!("unknown topic '{topic}'")));
        }
        Ok(())
    }
}

#[async_trait]
impl LogReader for MemoryLog {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, FetchError> {
        self.check_topic(topic)?;
        let mut partitions: Vec<i32> = self.partitions.iter().map(|e| *e.key()).collect();
        partitions.sort_unstable();
        Ok(partitions)
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<Watermarks, FetchError> {
        self.check_topic(topic)?;
        let log = self.partitions.get(&partition).ok_or_else(|| {
            FetchError::Permanent(format!("unknown partition {topic}:{partition}"))
        })?;
        Ok(Watermarks {
            low: log.low,
            high: log.high(),
        })
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        from: i64,
        max: usize,
    ) -> Result<Vec<Message>, FetchError> {
        self.check_topic(topic)?;

        let failing = self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(FetchError::Transient("injected fetch failure".to_string()));
        }

        let log = self.partitions.get(&partition).ok_or_else(|| {
            FetchError::Permanent(format!("unknown partition {topic}:{partition}"))
        })?;

        let start = (from.max(log.low) - log.low) as usize;
        Ok(log.messages.iter().skip(start).take(max).cloned().collect())
    }
}
