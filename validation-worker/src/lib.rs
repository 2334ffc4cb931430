pub mod config;
pub mod metrics_consts;
pub mod rules;
pub mod stage;
