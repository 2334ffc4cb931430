pub const EVENTS_CONSUMED: &str = "updater_events_consumed";
pub const AGGREGATES_COMPUTED: &str = "updater_aggregates_computed";
pub const AGGREGATES_PERSISTED: &str = "updater_aggregates_persisted";
pub const UPDATE_ERRORS: &str = "updater_errors";
pub const TUTORS_UPDATED: &str = "updater_tutors_updated";
pub const PENDING_ENTRIES: &str = "updater_pending_entries";
