use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use rdkafka::error::KafkaError;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use stream_pipeline::config::Config;
use stream_pipeline::cursor_store::FileCursorStore;
use stream_pipeline::dead_letter::{DeadLetterSink, KafkaDeadLetterSink, LogDeadLetterSink};
use stream_pipeline::error::{DeadLetterError, ErrorCategory, PipelineError};
use stream_pipeline::handler::MatchCountHandler;
use stream_pipeline::pipeline::{Pipeline, PipelineComponents, StopReport};
use stream_pipeline::source::KafkaLog;

fn setup_tracing() {
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    if let Ok(directive) = "rdkafka=warn".parse() {
        filter = filter.add_directive(directive);
    }
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

/// User-visible category of a top-level error, decides the exit code
fn category_of(error: &anyhow::Error) -> ErrorCategory {
    if let Some(e) = error.downcast_ref::<PipelineError>() {
        return e.category();
    }
    if error.downcast_ref::<envconfig::Error>().is_some() {
        return ErrorCategory::Config;
    }
    if error.downcast_ref::<KafkaError>().is_some()
        || error.downcast_ref::<DeadLetterError>().is_some()
    {
        return ErrorCategory::ConnectionUnavailable;
    }
    ErrorCategory::Internal
}

async fn run() -> anyhow::Result<StopReport> {
    let config = Config::init_from_env().context("failed to load configuration from env")?;
    let pipeline_config = config.to_pipeline_config()?;

    info!(
        topic = pipeline_config.topic,
        source_id = pipeline_config.source_id,
        resume_policy = %pipeline_config.resume_policy,
        grouping = %pipeline_config.grouping_policy,
        source_parallelism = pipeline_config.source_parallelism,
        handler_instances = pipeline_config.handler_instances,
        "Configuration loaded"
    );

    let log = KafkaLog::new(&config.kafka, &config.source_id, config.fetch_wait())
        .context("failed to create Kafka log reader")?;

    let dead_letters: Arc<dyn DeadLetterSink> = match &config.dead_letter_topic {
        Some(topic) => Arc::new(
            KafkaDeadLetterSink::new(&config.kafka, topic)
                .context("failed to create dead-letter producer")?,
        ),
        None => Arc::new(LogDeadLetterSink),
    };

    let components = PipelineComponents {
        log: Arc::new(log),
        cursor_store: Arc::new(FileCursorStore::new(&config.cursor_store_path)),
        dead_letters,
        handlers: Arc::new(MatchCountHandler::factory(config.match_target.clone())),
    };

    let mut pipeline = Pipeline::new(pipeline_config, components)?;
    let report = pipeline
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl+c: {e:#}");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await?;

    Ok(report)
}

#[tokio::main]
async fn main() {
    setup_tracing();
    info!("Starting stream pipeline...");

    match run().await {
        Ok(report) => {
            info!(
                acked = report.acked,
                dead_lettered = report.dead_lettered,
                abandoned = report.abandoned,
                cursors = ?report.cursors,
                "Stream pipeline exited"
            );
        }
        Err(e) => {
            let category = category_of(&e);
            error!(category = %category, "Stream pipeline failed: {e:#}");
            std::process::exit(category.exit_code());
        }
    }
}
