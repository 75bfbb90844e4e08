// System
use std::time::Duration;

// Third Party
use clap::Parser;

/// Environment variable carrying the name of the Node this agent runs on,
/// typically injected via the downward API.
pub const NODE_NAME_ENV: &str = "NODE_NAME";

#[derive(Debug, Parser)]
#[clap(name = "linode-node-decorator")]
pub struct Options {
    /// The interval (in seconds) to poll and update node information
    #[clap(long = "poll-interval", default_value_t = 60)]
    pub poll_interval_seconds: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {NODE_NAME_ENV} is not set")]
    MissingNodeName,
    #[error("polling interval must be greater than zero")]
    InvalidPollInterval,
}

/// Resolved agent configuration. Environment reading happens only here, at
/// the bootstrap layer; the rest of the crate takes these as plain values.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_name: String,
    pub poll_interval: Duration,
}

impl Config {
    pub fn load(options: &Options) -> Result<Self, ConfigError> {
        let node_name = std::env::var(NODE_NAME_ENV).unwrap_or_default();
        if node_name.is_empty() {
            return Err(ConfigError::MissingNodeName);
        }
        if options.poll_interval_seconds == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }
        Ok(Self {
            node_name,
            poll_interval: Duration::from_secs(options.poll_interval_seconds),
        })
    }
}
