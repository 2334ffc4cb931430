pub const RUNS_COMPLETED: &str = "aggregator_runs_completed";
pub const ENTITIES_SUCCEEDED: &str = "aggregator_entities_succeeded";
pub const ENTITIES_FAILED: &str = "aggregator_entities_failed";
pub const ENTITIES_SKIPPED: &str = "aggregator_entities_skipped";
pub const METRICS_SAVED: &str = "aggregator_metrics_saved";
pub const RUN_TIME: &str = "aggregator_run_time_seconds";
pub const RETENTION_DELETED: &str = "aggregator_retention_deleted";
