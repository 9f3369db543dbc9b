use async_trait::async_trait;

use crate::error::FetchError;
use crate::types::Message;

/// Retained offset range of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    /// Oldest retained offset
    pub low: i64,
    /// Offset the next appended message will get
    pub high: i64,
}

/// Read access to a partitioned, append-only log
#[async_trait]
pub trait LogReader: Send + Sync {
    /// All partitions of a topic, sorted. Fails permanently if the topic does not exist.
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, FetchError>;

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<Watermarks, FetchError>;

    /// Fetch up to `max` messages with offset >= `from`, in offset order.
    /// An empty result means nothing is available yet.
    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        from: i64,
        max: usize,
    ) -> Result<Vec<Message>, FetchError>;
}
