use std::time::Duration;

use envconfig::Envconfig;
use pipeline_core::{Channel, PublisherConfig, WorkerConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    /// Comma-separated raw channels this worker validates. Retry channels
    /// are served automatically alongside each.
    #[envconfig(default = "tutors,sessions,feedback")]
    pub channels: String,

    #[envconfig(default = "validation-workers")]
    pub consumer_group: String,

    #[envconfig(from = "HOSTNAME", default = "validation-worker")]
    pub consumer_name: String,

    #[envconfig(default = "100")]
    pub batch_size: usize,

    #[envconfig(default = "1000")]
    pub poll_interval_ms: u64,

    #[envconfig(default = "2000")]
    pub block_timeout_ms: u64,

    #[envconfig(default = "3")]
    pub max_retries: u32,

    #[envconfig(default = "30000")]
    pub claim_interval_ms: u64,

    #[envconfig(default = "60000")]
    pub claim_min_idle_ms: u64,

    #[envconfig(default = "100000")]
    pub max_stream_length: u64,

    #[envconfig(default = "604800")]
    pub stream_ttl_seconds: u64,

    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,
}

impl Config {
    pub fn channels(&self) -> anyhow::Result<Vec<Channel>> {
        self.channels
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Ok(s.parse::<Channel>()?))
            .collect()
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: self.batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            block_timeout: Duration::from_millis(self.block_timeout_ms),
            max_retries: self.max_retries,
            claim_interval: Duration::from_millis(self.claim_interval_ms),
            claim_min_idle: Duration::from_millis(self.claim_min_idle_ms),
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            max_stream_length: self.max_stream_length,
            stream_ttl: Duration::from_secs(self.stream_ttl_seconds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_list_parses_and_rejects_unknown() {
        let mut config = Config::init_from_hashmap(&Default::default()).unwrap();
        assert_eq!(config.channels().unwrap().len(), 3);

        config.channels = "sessions, feedback".to_string();
        assert_eq!(
            config.channels().unwrap(),
            vec![Channel::Sessions, Channel::Feedback]
        );

        config.channels = "sessions,bogus".to_string();
        assert!(config.channels().is_err());
    }
}
