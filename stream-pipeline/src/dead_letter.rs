//! Dead-letter sinks for messages whose handler kept failing.
//!
//! A message is only acknowledged after its dead letter was written. When the
//! sink keeps failing the message stays unacknowledged and the failure is
//! escalated, so the message is redelivered after a restart.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::DeadLetterError;
use crate::types::Message;

/// A message that exhausted its retries, with the last failure reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: String,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn write(&self, message: &Message, reason: &str) -> Result<(), DeadLetterError>;
}

/// Keeps dead letters in memory, used by tests and embedded pipelines
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    entries: Mutex<Vec<DeadLetter>>,
    failures_remaining: Mutex<u32>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<DeadLetter> {
        self.entries.lock().await.clone()
    }

    /// Make the next `count` writes fail
    pub async fn fail_next_writes(&self, count: u32) {
        *self.failures_remaining.lock().await = count;
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn write(&self, message: &Message, reason: &str) -> Result<(), DeadLetterError> {
        {
            let mut failures = self.failures_remaining.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(DeadLetterError::Unavailable("injected failure".to_string()));
            }
        }

        self.entries.lock().await.push(DeadLetter {
            message: message.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

/// Records dead letters in the process log only
pub struct LogDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    async fn write(&self, message: &Message, reason: &str) -> Result<(), DeadLetterError> {
        error!(
            partition = message.partition(),
            offset = message.offset(),
            size = message.size(),
            reason = reason,
            "Dead letter: {}",
            message.payload_str()
        );
        Ok(())
    }
}

/// Produces dead letters to a Kafka topic. The payload and key are copied
/// as-is, the failure context travels in headers.
pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl KafkaDeadLetterSink {
    pub fn new(config: &KafkaConfig, topic: impl Into<String>) -> Result<Self, DeadLetterError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                config.kafka_compression_codec.to_owned(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer = client_config.create()?;

        // "Ping" the brokers so a bad address fails at startup
        match producer
            .client()
            .fetch_metadata(None, Duration::from_secs(15))
        {
            Ok(metadata) => {
                info!(
                    "Dead-letter producer connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error.into());
            }
        }

        Ok(Self {
            producer,
            topic: topic.into(),
            send_timeout: Duration::from_millis(u64::from(config.kafka_message_timeout_ms)),
        })
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn write(&self, message: &Message, reason: &str) -> Result<(), DeadLetterError> {
        let partition = message.partition().to_string();
        let offset = message.offset().to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "dead-letter-reason",
                value: Some(reason),
            })
            .insert(Header {
                key: "source-partition",
                value: Some(partition.as_str()),
            })
            .insert(Header {
                key: "source-offset",
                value: Some(offset.as_str()),
            });

        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&self.topic)
            .payload(message.payload())
            .headers(headers);
        if let Some(key) = message.key() {
            record = record.key(key);
        }

        match self.producer.send(record, self.send_timeout).await {
            Ok(_) => {
                debug!(
                    topic = self.topic,
                    partition = message.partition(),
                    offset = message.offset(),
                    "Produced dead letter"
                );
                Ok(())
            }
            Err((e, _)) => {
                warn!(topic = self.topic, error = %e, "Failed to produce dead letter");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_records_reason() {
        let sink = MemoryDeadLetterSink::new();
        let message = Message::new(1, 7, "boom");

        sink.write(&message, "handler failed 3 times").await.unwrap();

        let entries = sink.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, message);
        assert_eq!(entries[0].reason, "handler failed 3 times");
    }

    #[tokio::test]
    async fn test_memory_sink_injected_failures() {
        let sink = MemoryDeadLetterSink::new();
        sink.fail_next_writes(1).await;
        let message = Message::new(0, 0, "x");

        assert!(sink.write(&message, "r").await.is_err());
        assert!(sink.write(&message, "r").await.is_ok());
        assert_eq!(sink.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_log_sink_always_succeeds() {
        let sink = LogDeadLetterSink;
        assert!(sink.write(&Message::new(0, 3, "x"), "r").await.is_ok());
    }
}
