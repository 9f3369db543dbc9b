use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

use crate::error::PipelineError;
use crate::retry::RetryPolicy;

/// Where a partition reader starts when the pipeline starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePolicy {
    /// Replay all retained history
    Earliest,
    /// Skip the backlog, only deliver messages appended after start
    Latest,
    /// Resume after the stored cursor, or fall back to the default policy
    Stored,
}

impl FromStr for ResumePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(ResumePolicy::Earliest),
            "latest" => Ok(ResumePolicy::Latest),
            "stored" => Ok(ResumePolicy::Stored),
            other => Err(format!("unknown resume policy '{other}'")),
        }
    }
}

impl fmt::Display for ResumePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumePolicy::Earliest => f.write_str("earliest"),
            ResumePolicy::Latest => f.write_str("latest"),
            ResumePolicy::Stored => f.write_str("stored"),
        }
    }
}

/// How the distributor picks a handler instance for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupingPolicy {
    /// Uniformly random instance, ignoring message content. Not deterministic.
    Shuffle,
    /// Random instance on the reader's own worker if there is one, else shuffle
    LocalOrShuffle,
    /// Instance chosen by hashing the payload field at this index
    Fields(usize),
}

impl FromStr for GroupingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "shuffle" => Ok(GroupingPolicy::Shuffle),
            "local_or_shuffle" => Ok(GroupingPolicy::LocalOrShuffle),
            other => match other.strip_prefix("fields:") {
                Some(index) => index
                    .trim()
                    .parse()
                    .map(GroupingPolicy::Fields)
                    .map_err(|_| format!("invalid field index in grouping policy '{s}'")),
                None => Err(format!("unknown grouping policy '{s}'")),
            },
        }
    }
}

impl fmt::Display for GroupingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupingPolicy::Shuffle => f.write_str("shuffle"),
            GroupingPolicy::LocalOrShuffle => f.write_str("local_or_shuffle"),
            GroupingPolicy::Fields(index) => write!(f, "fields:{index}"),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(from = "KAFKA_TOPIC", default = "Messaging")]
    pub kafka_topic: String,

    // Reusing a source id across restarts resumes from its stored cursors
    #[envconfig(from = "SOURCE_ID", default = "KafkaMessagingSpout")]
    pub source_id: String,

    #[envconfig(from = "RESUME_POLICY", default = "stored")]
    pub resume_policy: String,

    #[envconfig(from = "DEFAULT_RESUME_POLICY", default = "latest")]
    pub default_resume_policy: String,

    // Comma separated, empty means every partition of the topic
    #[envconfig(from = "PARTITIONS", default = "")]
    pub partitions: String,

    #[envconfig(from = "SOURCE_PARALLELISM", default = "3")]
    pub source_parallelism: usize,

    #[envconfig(from = "HANDLER_INSTANCES", default = "2")]
    pub handler_instances: usize,

    #[envconfig(from = "WORKERS", default = "3")]
    pub workers: usize,

    #[envconfig(from = "GROUPING_POLICY", default = "local_or_shuffle")]
    pub grouping_policy: String,

    #[envconfig(from = "MAX_IN_FLIGHT_MESSAGES", default = "1000")]
    pub max_in_flight_messages: usize,

    #[envconfig(from = "HANDLER_QUEUE_CAPACITY", default = "100")]
    pub handler_queue_capacity: usize,

    #[envconfig(from = "FETCH_BATCH_SIZE", default = "100")]
    pub fetch_batch_size: usize,

    #[envconfig(from = "FETCH_WAIT_MS", default = "500")]
    pub fetch_wait_ms: u64,

    #[envconfig(from = "POLL_INTERVAL_MS", default = "100")]
    pub poll_interval_ms: u64,

    #[envconfig(from = "MAX_RETRIES", default = "2")]
    pub max_retries: u32,

    #[envconfig(from = "RETRY_INITIAL_INTERVAL_MS", default = "100")]
    pub retry_initial_interval_ms: u64,

    #[envconfig(from = "RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub retry_backoff_coefficient: u32,

    #[envconfig(from = "RETRY_MAXIMUM_INTERVAL_MS", default = "5000")]
    pub retry_maximum_interval_ms: u64,

    #[envconfig(from = "IO_MAX_RETRIES", default = "5")]
    pub io_max_retries: u32,

    #[envconfig(from = "HANDLER_TIMEOUT_MS", default = "30000")]
    pub handler_timeout_ms: u64,

    #[envconfig(from = "SHUTDOWN_GRACE_PERIOD_MS", default = "30000")]
    pub shutdown_grace_period_ms: u64,

    #[envconfig(from = "COMMIT_INTERVAL_MS", default = "1000")]
    pub commit_interval_ms: u64,

    #[envconfig(from = "CURSOR_STORE_PATH", default = "./cursors.json")]
    pub cursor_store_path: String,

    // Permanently failed messages are only logged when unset
    pub dead_letter_topic: Option<String>,

    #[envconfig(from = "MATCH_TARGET", default = "Hello World")]
    pub match_target: String,

    #[envconfig(from = "MAX_PIPELINE_RESTARTS", default = "3")]
    pub max_pipeline_restarts: u32,
}

impl Config {
    pub fn partition_list(&self) -> Result<Option<Vec<i32>>, PipelineError> {
        let partitions: Vec<&str> = self
            .partitions
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if partitions.is_empty() {
            return Ok(None);
        }
        partitions
            .into_iter()
            .map(|p| {
                p.parse().map_err(|_| {
                    PipelineError::PermanentConfig(format!("invalid partition '{p}'"))
                })
            })
            .collect::<Result<Vec<i32>, _>>()
            .map(Some)
    }

    /// Build the validated configuration the pipeline is started with
    pub fn to_pipeline_config(&self) -> Result<PipelineConfig, PipelineError> {
        let resume_policy = self
            .resume_policy
            .parse()
            .map_err(PipelineError::PermanentConfig)?;
        let default_resume_policy = self
            .default_resume_policy
            .parse()
            .map_err(PipelineError::PermanentConfig)?;
        let grouping_policy = self
            .grouping_policy
            .parse()
            .map_err(PipelineError::PermanentConfig)?;

        let config = PipelineConfig {
            topic: self.kafka_topic.clone(),
            source_id: self.source_id.clone(),
            partitions: self.partition_list()?,
            resume_policy,
            default_resume_policy,
            source_parallelism: self.source_parallelism,
            handler_instances: self.handler_instances,
            workers: self.workers,
            grouping_policy,
            max_in_flight_messages: self.max_in_flight_messages,
            handler_queue_capacity: self.handler_queue_capacity,
            fetch_batch_size: self.fetch_batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_retries: self.max_retries,
            retry_policy: RetryPolicy::build(
                self.retry_backoff_coefficient,
                Duration::from_millis(self.retry_initial_interval_ms),
            )
            .maximum_interval(Duration::from_millis(self.retry_maximum_interval_ms))
            .provide(),
            io_max_retries: self.io_max_retries,
            handler_timeout: Duration::from_millis(self.handler_timeout_ms),
            shutdown_grace_period: Duration::from_millis(self.shutdown_grace_period_ms),
            commit_interval: Duration::from_millis(self.commit_interval_ms),
            max_restarts: self.max_pipeline_restarts,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn fetch_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_wait_ms)
    }
}

/// Explicit configuration of one pipeline, passed at start
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub topic: String,
    pub source_id: String,
    /// Partitions owned by this pipeline, all partitions of the topic when None
    pub partitions: Option<Vec<i32>>,
    pub resume_policy: ResumePolicy,
    /// Used by `Stored` when a partition has no cursor, must be earliest or latest
    pub default_resume_policy: ResumePolicy,
    /// Number of concurrent partition readers
    pub source_parallelism: usize,
    /// Number of handler instances (fan-out degree)
    pub handler_instances: usize,
    /// Number of logical worker processes readers and handlers are placed on
    pub workers: usize,
    pub grouping_policy: GroupingPolicy,
    /// Bound on delivered but not yet acknowledged messages
    pub max_in_flight_messages: usize,
    pub handler_queue_capacity: usize,
    pub fetch_batch_size: usize,
    /// Pause between fetches when a reader found nothing new
    pub poll_interval: Duration,
    /// Redeliveries of a failed message before it is dead-lettered
    pub max_retries: u32,
    pub retry_policy: RetryPolicy,
    /// Attempts at transient I/O before escalating to the driver
    pub io_max_retries: u32,
    pub handler_timeout: Duration,
    pub shutdown_grace_period: Duration,
    pub commit_interval: Duration,
    /// Whole-pipeline restarts after exhausted transient I/O before giving up
    pub max_restarts: u32,
}

impl PipelineConfig {
    /// A configuration with the defaults of [`Config`]
    pub fn new(topic: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            source_id: source_id.into(),
            partitions: None,
            resume_policy: ResumePolicy::Stored,
            default_resume_policy: ResumePolicy::Latest,
            source_parallelism: 1,
            handler_instances: 1,
            workers: 1,
            grouping_policy: GroupingPolicy::Shuffle,
            max_in_flight_messages: 1000,
            handler_queue_capacity: 100,
            fetch_batch_size: 100,
            poll_interval: Duration::from_millis(100),
            max_retries: 2,
            retry_policy: RetryPolicy::default(),
            io_max_retries: 5,
            handler_timeout: Duration::from_secs(30),
            shutdown_grace_period: Duration::from_secs(30),
            commit_interval: Duration::from_secs(1),
            max_restarts: 3,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |reason: &str| -> Result<(), PipelineError> {
            Err(PipelineError::PermanentConfig(reason.to_string()))
        };

        if self.topic.is_empty() {
            return invalid("topic must not be empty");
        }
        if self.source_id.is_empty() {
            return invalid("source id must not be empty");
        }
        if self.handler_instances == 0 {
            return invalid("handler instances must be at least 1");
        }
        if self.source_parallelism == 0 {
            return invalid("source parallelism must be at least 1");
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.max_in_flight_messages == 0 {
            return invalid("max in-flight messages must be at least 1");
        }
        if self.handler_queue_capacity == 0 {
            return invalid("handler queue capacity must be at least 1");
        }
        if self.fetch_batch_size == 0 {
            return invalid("fetch batch size must be at least 1");
        }
        if self.default_resume_policy == ResumePolicy::Stored {
            return invalid("default resume policy must be earliest or latest");
        }
        if matches!(&self.partitions, Some(p) if p.is_empty()) {
            return invalid("partition list must not be empty");
        }
        Ok(())
    }
}
