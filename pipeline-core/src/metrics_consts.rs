pub const MESSAGES_PUBLISHED: &str = "pipeline_messages_published";
pub const BATCHES_PUBLISHED: &str = "pipeline_batches_published";
pub const MESSAGES_CONSUMED: &str = "pipeline_messages_consumed";
pub const MESSAGES_ACKED: &str = "pipeline_messages_acked";
pub const MESSAGES_RETRIED: &str = "pipeline_messages_retried";
pub const MESSAGES_DEAD_LETTERED: &str = "pipeline_messages_dead_lettered";
pub const MESSAGES_CLAIMED: &str = "pipeline_messages_claimed";
pub const DECODE_FAILURES: &str = "pipeline_decode_failures";
pub const WORKER_PASSES: &str = "pipeline_worker_passes";
pub const WORKER_EMPTY_PASSES: &str = "pipeline_worker_empty_passes";
pub const WORKER_HANDLER_FAILURES: &str = "pipeline_worker_handler_failures";
pub const WORKER_BACKEND_ERRORS: &str = "pipeline_worker_backend_errors";
pub const WORKER_PASS_TIME: &str = "pipeline_worker_pass_time_ms";
pub const STORE_BATCH_WRITE_TIME: &str = "pipeline_store_batch_write_ms";
pub const STORE_BATCH_ITEMS_FAILED: &str = "pipeline_store_batch_items_failed";
pub const AGGREGATES_SAVED: &str = "pipeline_aggregates_saved";
