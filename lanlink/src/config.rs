use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};

/// Top level layout shared by every lanlink TOML file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LanlinkConfig {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub pubsub: PubSubOptions,
}

/// Resolver level settings, fixed for the lifetime of its mDNS daemon
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryConfig {
    /// Restrict multicast traffic to one interface, e.g. "wlan0"
    #[serde(default)]
    pub interface: Option<String>,
    /// Address announced for advertised services; every interface address
    /// when unset
    #[serde(default)]
    pub address: Option<IpAddr>,
    /// Defaults applied when a discovery call passes no options
    #[serde(default)]
    pub options: DiscoveryOptions,
}

/// Per session discovery settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DiscoveryOptions {
    /// Drop IPv6 addresses from resolved records
    #[serde(default)]
    pub ipv4_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PubSubOptions {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Messages queued per subscriber before further ones are dropped
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
}

fn default_connect_timeout() -> u64 {
    1000
}

fn default_connect_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    500
}

fn default_high_water_mark() -> usize {
    1000
}

impl Default for PubSubOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            connect_retries: default_connect_retries(),
            retry_delay_ms: default_retry_delay(),
            high_water_mark: default_high_water_mark(),
        }
    }
}

impl PubSubOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl LanlinkConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: LanlinkConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: LanlinkConfig = toml::from_str("").unwrap();

        assert!(config.discovery.interface.is_none());
        assert!(config.discovery.address.is_none());
        assert!(!config.discovery.options.ipv4_only);
        assert_eq!(config.pubsub, PubSubOptions::default());
        assert_eq!(config.pubsub.connect_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_sections() {
        let config: LanlinkConfig = toml::from_str(
            r#"
            [discovery]
            interface = "wlan0"
            address = "192.168.1.20"

            [discovery.options]
            ipv4_only = true

            [pubsub]
            connect_retries = 0
            high_water_mark = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.discovery.interface.as_deref(), Some("wlan0"));
        assert_eq!(config.discovery.address, Some("192.168.1.20".parse().unwrap()));
        assert!(config.discovery.options.ipv4_only);
        assert_eq!(config.pubsub.connect_retries, 0);
        assert_eq!(config.pubsub.high_water_mark, 16);
        assert_eq!(config.pubsub.retry_delay_ms, 500);
    }
}
