use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use lanlink::{DiscoveryConfig, PubSubOptions};
use shared::types::ServiceFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Subscriber,
    Publisher,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub role: Role,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub pubsub: PubSubOptions,
    pub subscriber: Option<SubscriberConfig>,
    pub publisher: Option<PublisherConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriberConfig {
    /// Service to look for, e.g. { name = "zmq", protocol = "tcp", subtypes = ["cpuTemp"] }
    pub service: ServiceFilter,
    #[serde(default = "default_topic")]
    pub topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    /// JSON service description to advertise
    pub description: PathBuf,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_publish_interval")]
    pub publish_interval_secs: u64,
}

fn default_topic() -> String {
    "/Intel/temperature".to_string()
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_publish_interval() -> u64 {
    5
}

impl PublisherConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}
