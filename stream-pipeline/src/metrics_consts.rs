// ==== Source metrics ====
/// Counter for messages fetched from the log
pub const SOURCE_MESSAGES_FETCHED: &str = "pipeline_source_messages_fetched_total";

/// Counter for fetch errors, labelled by kind (transient/permanent)
pub const SOURCE_FETCH_ERRORS: &str = "pipeline_source_fetch_errors_total";

/// Counter for times a reader waited on the in-flight bound
pub const SOURCE_BACKPRESSURE_TOTAL: &str = "pipeline_source_backpressure_total";

// ==== Handler metrics ====
/// Counter for terminal outcomes, labelled by status (acked/dead_lettered/abandoned)
pub const MESSAGES_COMPLETED: &str = "pipeline_messages_completed_total";

/// Counter for handler attempts that returned Fail or timed out
pub const HANDLER_FAILURES: &str = "pipeline_handler_failures_total";

/// Histogram for handler invocation time
pub const HANDLER_DURATION_MS: &str = "pipeline_handler_duration_ms";

// ==== Offset tracker metrics ====
/// Gauge for the last durably committed offset per partition
pub const PARTITION_LAST_COMMITTED_OFFSET: &str = "pipeline_partition_last_committed_offset";

/// Counter for acknowledgments that arrived out of delivery order
pub const OUT_OF_ORDER_ACKS: &str = "pipeline_out_of_order_acks_total";

/// Counter for duplicate or superseded acknowledgments
pub const DUPLICATE_ACKS: &str = "pipeline_duplicate_acks_total";
