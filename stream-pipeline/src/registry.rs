use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{PipelineError, RegistryError};
use crate::pipeline::{Pipeline, StopReport};
use crate::types::Cursor;

#[derive(Default)]
struct Pipelines {
    running: HashMap<String, Pipeline>,
    /// Pipelines stopped after a fatal error, kept until killed or resubmitted
    failed: HashMap<String, PipelineError>,
}

impl Pipelines {
    /// Stop and move out every pipeline whose run reported a fatal error
    async fn reap_failed(&mut self) {
        let mut failures = Vec::new();
        for (name, pipeline) in self.running.iter_mut() {
            if let Some(error) = pipeline.take_fatal_error() {
                failures.push((name.clone(), error));
            }
        }

        for (name, error) in failures {
            if let Some(mut pipeline) = self.running.remove(&name) {
                error!(
                    pipeline = name,
                    category = %error.category(),
                    "Pipeline failed: {error:#}"
                );
                if let Err(stop_error) = pipeline.stop().await {
                    warn!(pipeline = name, "Failed pipeline did not stop cleanly: {stop_error:#}");
                }
            }
            self.failed.insert(name, error);
        }
    }
}

/// Named, running pipelines of this process: the submit, kill and list
/// lifecycle commands.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: Mutex<Pipelines>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `pipeline` and register it under `name`
    pub async fn submit(&self, name: impl Into<String>, mut pipeline: Pipeline) -> Result<(), RegistryError> {
        let name = name.into();
        let mut pipelines = self.pipelines.lock().await;
        pipelines.reap_failed().await;
        if pipelines.running.contains_key(&name) {
            return Err(RegistryError::AlreadyRunning(name));
        }

        pipeline
            .start()
            .await
            .map_err(|source| RegistryError::Pipeline {
                name: name.clone(),
                source,
            })?;

        info!(pipeline = name, "Pipeline submitted");
        pipelines.failed.remove(&name);
        pipelines.running.insert(name, pipeline);
        Ok(())
    }

    /// Stop the named pipeline in order and remove it. A pipeline that
    /// already failed is removed and its fatal error returned.
    pub async fn kill(&self, name: &str) -> Result<StopReport, RegistryError> {
        let mut pipeline = {
            let mut pipelines = self.pipelines.lock().await;
            pipelines.reap_failed().await;
            if let Some(source) = pipelines.failed.remove(name) {
                return Err(RegistryError::Pipeline {
                    name: name.to_string(),
                    source,
                });
            }
            pipelines
                .running
                .remove(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?
        };

        let report = pipeline
            .stop()
            .await
            .map_err(|source| RegistryError::Pipeline {
                name: name.to_string(),
                source,
            })?;

        info!(pipeline = name, "Pipeline killed");
        Ok(report)
    }

    /// Names of running pipelines, sorted. Pipelines that hit a fatal error
    /// are stopped and no longer listed.
    pub async fn list(&self) -> Vec<String> {
        let mut pipelines = self.pipelines.lock().await;
        pipelines.reap_failed().await;
        let mut names: Vec<String> = pipelines.running.keys().cloned().collect();
        names.sort();
        names
    }

    /// Committed cursors of a running pipeline
    pub async fn cursors(&self, name: &str) -> Result<Vec<Cursor>, RegistryError> {
        let mut pipelines = self.pipelines.lock().await;
        pipelines.reap_failed().await;
        pipelines
            .running
            .get(name)
            .map(Pipeline::cursors)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;

    use crate::config::PipelineConfig;
    use crate::cursor_store::MemoryCursorStore;
    use crate::dead_letter::LogDeadLetterSink;
    use crate::error::ErrorCategory;
    use crate::handler::{Handler, HandlerContext, MatchCountHandler, Outcome};
    use crate::pipeline::PipelineComponents;
    use crate::source::MemoryLog;
    use crate::types::Message;

    fn pipeline(topic: &str) -> Pipeline {
        let components = PipelineComponents {
            log: Arc::new(MemoryLog::new("Messaging", 1)),
            cursor_store: Arc::new(MemoryCursorStore::new()),
            dead_letters: Arc::new(LogDeadLetterSink),
            handlers: Arc::new(MatchCountHandler::factory("Hello World")),
        };
        Pipeline::new(PipelineConfig::new(topic, "spout"), components).unwrap()
    }

    struct UnstartableHandler;

    #[async_trait]
    impl Handler for UnstartableHandler {
        async fn on_start(&mut self, _context: &HandlerContext) -> anyhow::Result<()> {
            anyhow::bail!("missing credentials")
        }

        async fn on_message(&mut self, _message: &Message) -> Outcome {
            Outcome::Ack
        }
    }

    fn unstartable_pipeline() -> Pipeline {
        let components = PipelineComponents {
            log: Arc::new(MemoryLog::new("Messaging", 1)),
            cursor_store: Arc::new(MemoryCursorStore::new()),
            dead_letters: Arc::new(LogDeadLetterSink),
            handlers: Arc::new(|_: &HandlerContext| -> Box<dyn Handler> { Box::new(UnstartableHandler) }),
        };
        Pipeline::new(PipelineConfig::new("Messaging", "spout"), components).unwrap()
    }

    #[tokio::test]
    async fn test_submit_list_kill() {
        let registry = PipelineRegistry::new();
        registry.submit("b", pipeline("Messaging")).await.unwrap();
        registry.submit("a", pipeline("Messaging")).await.unwrap();

        assert_eq!(registry.list().await, vec!["a".to_string(), "b".to_string()]);

        let report = registry.kill("a").await.unwrap();
        assert_eq!(report.acked, 0);
        assert_eq!(registry.list().await, vec!["b".to_string()]);
        registry.kill("b").await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_name_is_already_running() {
        let registry = PipelineRegistry::new();
        registry.submit("job", pipeline("Messaging")).await.unwrap();

        let error = registry
            .submit("job", pipeline("Messaging"))
            .await
            .unwrap_err();
        assert_eq!(error.category(), ErrorCategory::AlreadyRunning);
        assert_eq!(error.category().exit_code(), 4);
        registry.kill("job").await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_unknown_is_not_found() {
        let registry = PipelineRegistry::new();
        let error = registry.kill("missing").await.unwrap_err();
        assert_eq!(error.category(), ErrorCategory::NotFound);
        assert!(registry.cursors("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_submit_with_missing_topic_fails() {
        let registry = PipelineRegistry::new();
        let error = registry.submit("job", pipeline("Missing")).await.unwrap_err();

        assert!(matches!(
            error,
            RegistryError::Pipeline {
                source: PipelineError::PermanentConfig(_),
                ..
            }
        ));
        assert_eq!(error.category(), ErrorCategory::Config);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_pipeline_is_removed_and_reported() {
        let registry = PipelineRegistry::new();
        registry.submit("job", unstartable_pipeline()).await.unwrap();
        registry.submit("healthy", pipeline("Messaging")).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.list().await.contains(&"job".to_string()) {
            assert!(Instant::now() < deadline, "failed pipeline still listed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(registry.list().await, vec!["healthy".to_string()]);

        let error = registry.kill("job").await.unwrap_err();
        assert!(matches!(
            error,
            RegistryError::Pipeline {
                source: PipelineError::Fatal(_),
                ..
            }
        ));
        assert_eq!(error.category(), ErrorCategory::Internal);
        assert_eq!(registry.kill("job").await.unwrap_err().category(), ErrorCategory::NotFound);

        // the name can be reused once the failure was collected
        registry.submit("job", pipeline("Messaging")).await.unwrap();
        registry.kill("job").await.unwrap();
        registry.kill("healthy").await.unwrap();
    }
}
