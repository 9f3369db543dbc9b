use thiserror::Error;

use crate::retry::Exhausted;

/// Errors returned by a [`LogReader`](crate::source::LogReader).
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    /// The log is temporarily unavailable, the request can be retried
    #[error("log temporarily unavailable: {0}")]
    Transient(String),
    /// The topic or partition does not exist
    #[error("topic or partition not found: {0}")]
    Permanent(String),
}

/// Errors returned by a [`CursorStore`](crate::cursor_store::CursorStore).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cursor store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cursor store contains invalid data: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Errors returned by a [`DeadLetterSink`](crate::dead_letter::DeadLetterSink).
#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("failed to produce dead letter: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("dead letter sink unavailable: {0}")]
    Unavailable(String),
}

/// Pipeline level errors, surfaced to the driver.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// I/O kept failing after the configured number of retries
    #[error("transient I/O error in {component} persisted after {attempts} attempts: {reason}")]
    TransientIo {
        component: &'static str,
        attempts: u32,
        reason: String,
    },
    /// Missing topic, partition or invalid configuration, never retried
    #[error("configuration error: {0}")]
    PermanentConfig(String),
    #[error("fatal pipeline error: {0}")]
    Fatal(String),
    #[error("pipeline is already running")]
    AlreadyRunning,
    #[error("pipeline is not running")]
    NotRunning,
}

impl PipelineError {
    /// Whether restarting the whole pipeline may clear the error
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientIo { .. })
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::TransientIo { .. } => ErrorCategory::ConnectionUnavailable,
            PipelineError::PermanentConfig(_) => ErrorCategory::Config,
            PipelineError::Fatal(_) => ErrorCategory::Internal,
            PipelineError::AlreadyRunning => ErrorCategory::AlreadyRunning,
            PipelineError::NotRunning => ErrorCategory::NotFound,
        }
    }
}

impl From<FetchError> for PipelineError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::Transient(reason) => PipelineError::TransientIo {
                component: "source",
                attempts: 1,
                reason,
            },
            FetchError::Permanent(reason) => PipelineError::PermanentConfig(reason),
        }
    }
}

impl From<Exhausted<FetchError>> for PipelineError {
    fn from(exhausted: Exhausted<FetchError>) -> Self {
        match exhausted.error {
            FetchError::Transient(reason) => PipelineError::TransientIo {
                component: "source",
                attempts: exhausted.attempts,
                reason,
            },
            FetchError::Permanent(reason) => PipelineError::PermanentConfig(reason),
        }
    }
}

/// Errors returned by the [`PipelineRegistry`](crate::registry::PipelineRegistry).
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no running pipeline named '{0}'")]
    NotFound(String),
    #[error("a pipeline named '{0}' is already running")]
    AlreadyRunning(String),
    #[error("pipeline '{name}' failed: {source}")]
    Pipeline {
        name: String,
        source: PipelineError,
    },
}

impl RegistryError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RegistryError::NotFound(_) => ErrorCategory::NotFound,
            RegistryError::AlreadyRunning(_) => ErrorCategory::AlreadyRunning,
            RegistryError::Pipeline { source, .. } => source.category(),
        }
    }
}

/// User-visible failure category, each with its own process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    AlreadyRunning,
    ConnectionUnavailable,
    Config,
    Internal,
}

impl ErrorCategory {
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorCategory::Internal => 1,
            ErrorCategory::Config => 2,
            ErrorCategory::NotFound => 3,
            ErrorCategory::AlreadyRunning => 4,
            ErrorCategory::ConnectionUnavailable => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NotFound => "not-found",
            ErrorCategory::AlreadyRunning => "already-running",
            ErrorCategory::ConnectionUnavailable => "connection-unavailable",
            ErrorCategory::Config => "config",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_errors_map_to_pipeline_errors() {
        let transient: PipelineError = FetchError::Transient("broker down".to_string()).into();
        assert!(transient.is_retryable());
        assert_eq!(transient.category(), ErrorCategory::ConnectionUnavailable);

        let permanent: PipelineError = FetchError::Permanent("no such topic".to_string()).into();
        assert!(!permanent.is_retryable());
        assert_eq!(permanent.category(), ErrorCategory::Config);
    }

    #[test]
    fn test_exhausted_fetch_keeps_attempt_count() {
        let error: PipelineError = Exhausted {
            error: FetchError::Transient("broker down".to_string()),
            attempts: 5,
        }
        .into();
        assert!(matches!(
            error,
            PipelineError::TransientIo { attempts: 5, component: "source", .. }
        ));
    }

    #[test]
    fn test_exit_codes_are_distinct_and_non_zero() {
        let categories = [
            ErrorCategory::NotFound,
            ErrorCategory::AlreadyRunning,
            ErrorCategory::ConnectionUnavailable,
            ErrorCategory::Config,
            ErrorCategory::Internal,
        ];
        let mut codes: Vec<i32> = categories.iter().map(|c| c.exit_code()).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), categories.len());
    }
}
