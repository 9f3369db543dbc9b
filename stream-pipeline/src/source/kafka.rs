use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message as _;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::KafkaConfig;
use crate::error::FetchError;
use crate::source::log::{LogReader, Watermarks};
use crate::types::Message;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// After the first message of a fetch arrived, wait at most this long for more
const FOLLOW_UP_WAIT: Duration = Duration::from_millis(10);

fn classify(error: KafkaError) -> FetchError {
    match error.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::UnknownTopicOrPartition
            | RDKafkaErrorCode::UnknownTopic
            | RDKafkaErrorCode::UnknownPartition,
        ) => FetchError::Permanent(error.to_string()),
        _ => FetchError::Transient(error.to_string()),
    }
}

struct PartitionConsumer {
    consumer: StreamConsumer,
    /// Offset the consumer will return next, None when it must be re-assigned
    position: Mutex<Option<i64>>,
}

/// Kafka backed log reader.
///
/// Partitions are assigned manually, one consumer per partition, and no
/// offsets are ever committed to Kafka: the cursor store is the only record
/// of progress.
pub struct KafkaLog {
    client_config: ClientConfig,
    metadata_client: Arc<BaseConsumer>,
    consumers: DashMap<i32, Arc<PartitionConsumer>>,
    fetch_wait: Duration,
}

impl KafkaLog {
    pub fn new(config: &KafkaConfig, group_id: &str, fetch_wait: Duration) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("fetch.wait.max.ms", "100");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let metadata_client: BaseConsumer = client_config.create()?;

        info!(hosts = config.kafka_hosts, group_id = group_id, "Created Kafka log reader");

        Ok(Self {
            client_config,
            metadata_client: Arc::new(metadata_client),
            consumers: DashMap::new(),
            fetch_wait,
        })
    }

    fn consumer_for(&self, partition: i32) -> Result<Arc<PartitionConsumer>, FetchError> {
        if let Some(consumer) = self.consumers.get(&partition) {
            return Ok(consumer.clone());
        }

        let consumer: StreamConsumer = self.client_config.create().map_err(classify)?;
        let consumer = Arc::new(PartitionConsumer {
            consumer,
            position: Mutex::new(None),
        });
        Ok(self.consumers.entry(partition).or_insert(consumer).clone())
    }
}

#[async_trait]
impl LogReader for KafkaLog {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, FetchError> {
        let client = self.metadata_client.clone();
        let owned_topic = topic.to_string();
        let metadata = tokio::task::spawn_blocking(move || {
            client.fetch_metadata(Some(&owned_topic), METADATA_TIMEOUT)
        })
        .await
        .map_err(|e| FetchError::Transient(format!("metadata task failed: {e}")))?
        .map_err(classify)?;

        let Some(topic_metadata) = metadata.topics().iter().find(|t| t.name() == topic) else {
            return Err(FetchError::Permanent(format!("unknown topic '{topic}'")));
        };
        if topic_metadata.error().is_some() || topic_metadata.partitions().is_empty() {
            return Err(FetchError::Permanent(format!(
                "topic '{topic}' is not available: {:?}",
                topic_metadata.error()
            )));
        }

        let mut partitions: Vec<i32> = topic_metadata.partitions().iter().map(|p| p.id()).collect();
        partitions.sort_unstable();
        Ok(partitions)
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<Watermarks, FetchError> {
        let client = self.metadata_client.clone();
        let owned_topic = topic.to_string();
        let (low, high) = tokio::task::spawn_blocking(move || {
            client.fetch_watermarks(&owned_topic, partition, METADATA_TIMEOUT)
        })
        .await
        .map_err(|e| FetchError::Transient(format!("watermark task failed: {e}")))?
        .map_err(classify)?;

        Ok(Watermarks { low, high })
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        from: i64,
        max: usize,
    ) -> Result<Vec<Message>, FetchError> {
        let partition_consumer = self.consumer_for(partition)?;
        let mut position = partition_consumer.position.lock().await;

        if *position != Some(from) {
            let mut assignment = TopicPartitionList::new();
            assignment
                .add_partition_offset(topic, partition, Offset::Offset(from))
                .map_err(classify)?;
            partition_consumer
                .consumer
                .assign(&assignment)
                .map_err(classify)?;
            debug!(topic = topic, partition = partition, offset = from, "Assigned partition consumer");
            *position = Some(from);
        }

        let mut messages = Vec::with_capacity(max);
        let mut wait = self.fetch_wait;
        while messages.len() < max {
            let received = tokio::time::timeout(wait, partition_consumer.consumer.recv()).await;
            let message = match received {
                Err(_) => break,
                Ok(Err(e)) => {
                    *position = None;
                    if messages.is_empty() {
                        return Err(classify(e));
                    }
                    break;
                }
                Ok(Ok(message)) => message,
            };

            if message.offset() < from {
                continue;
            }

            let mut fetched = Message::new(
                message.partition(),
                message.offset(),
                Bytes::copy_from_slice(message.payload().unwrap_or_default()),
            );
            if let Some(key) = message.key() {
                fetched = fetched.with_key(Bytes::copy_from_slice(key));
            }
            *position = Some(message.offset() + 1);
            messages.push(fetched);
            wait = FOLLOW_UP_WAIT;
        }

        Ok(messages)
    }
}
