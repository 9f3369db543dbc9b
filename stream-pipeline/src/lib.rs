//! At-least-once stream pipeline.
//!
//! Partition readers pull messages from a partitioned log, a distributor fans
//! them out to a pool of handler instances, and acknowledgments flow back to an
//! offset tracker that durably records, per partition, the last offset below
//! which everything has been processed.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}`: full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e`: full chain with `Caused by:` sections (Debug).
//!
//! When constructing errors, use `.context()` / `.with_context()` so the original error remains
//! the source.

pub mod config;
pub mod cursor_store;
pub mod dead_letter;
pub mod distributor;
pub mod error;
pub mod handler;
pub mod metrics_consts;
pub mod offset_tracker;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod source;
pub mod types;

// Re-export commonly used types for convenience
pub use config::{Config, GroupingPolicy, PipelineConfig, ResumePolicy};
pub use error::{ErrorCategory, PipelineError, RegistryError};
pub use handler::{Handler, HandlerContext, HandlerFactory, Outcome};
pub use pipeline::{Pipeline, PipelineComponents, StopReport};
pub use registry::PipelineRegistry;
pub use types::{Cursor, Message};
