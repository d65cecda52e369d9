pub const RECORDS_RECEIVED: &str = "kafka_pipeline_records_received_total";
pub const SESSIONS_STARTED: &str = "kafka_pipeline_sessions_started_total";
pub const CONSUME_ERRORS: &str = "kafka_pipeline_consume_errors_total";
pub const OFFSET_COMMIT_ERRORS: &str = "kafka_pipeline_offset_commit_errors_total";

pub const DISPATCH_QUEUE_DEPTH: &str = "kafka_pipeline_dispatch_queue_depth";
pub const DISPATCH_BACKPRESSURE: &str = "kafka_pipeline_dispatch_backpressure_total";

// Labelled by outcome: ok, failed, panicked
pub const HANDLER_OUTCOMES: &str = "kafka_pipeline_handler_outcomes_total";
pub const HANDLER_DURATION: &str = "kafka_pipeline_handler_duration_seconds";
pub const ACTIVE_WORKERS: &str = "kafka_pipeline_active_workers";

// Labelled by outcome: success, failure
pub const PRODUCER_DELIVERIES: &str = "kafka_pipeline_producer_deliveries_total";
pub const PRODUCER_QUEUE_DEPTH: &str = "kafka_pipeline_producer_queue_depth";
pub const PRODUCER_QUEUE_DEPTH_LIMIT: &str = "kafka_pipeline_producer_queue_depth_limit";
pub const PRODUCER_QUEUE_BYTES: &str = "kafka_pipeline_producer_queue_bytes";
pub const PRODUCER_CALLBACK_QUEUE_DEPTH: &str = "kafka_pipeline_producer_callback_queue_depth";
