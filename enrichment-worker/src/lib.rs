pub mod config;
pub mod enrich;
pub mod metrics_consts;
pub mod stage;
