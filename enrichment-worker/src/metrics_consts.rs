pub const MESSAGES_ENRICHED: &str = "enrichment_messages_enriched";
pub const ENRICHMENT_FAILURES: &str = "enrichment_failures";
pub const ITEMS_PERSISTED: &str = "enrichment_items_persisted";
pub const PERSIST_FAILURES: &str = "enrichment_persist_failures";
