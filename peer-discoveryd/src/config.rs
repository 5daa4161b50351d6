use std::collections::HashMap;
use std::path::Path;
use serde::Deserialize;
use anyhow::{Context, Result};
use peer_discovery::{AnnouncerConfig, BrowserConfig, MdnsConfig};
use shared::protocol::{DEFAULT_SERVICE_TYPE, TXT_NODE, TXT_VERSION};
use shared::types::ServiceRecord;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub mdns: MdnsConfig,
    #[serde(default)]
    pub announcer: AnnouncerConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Instance name to announce; "peer-<hostname>" when unset
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Port of the application being announced
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_service_type() -> String {
    DEFAULT_SERVICE_TYPE.to_string()
}

fn default_listen() -> String {
    "[::]:8054".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl NodeConfig {
    /// Build the record this node announces.
    pub fn record(&self) -> Result<ServiceRecord> {
        let hostname = hostname::get()
            .context("Failed to get system hostname")?
            .to_string_lossy()
            .to_string();
        Ok(self.record_for_host(&hostname))
    }

    fn record_for_host(&self, hostname: &str) -> ServiceRecord {
        let instance = self
            .instance
            .clone()
            .unwrap_or_else(|| format!("peer-{}", hostname));

        let mut record = ServiceRecord::new(instance, &self.service_type, self.port);
        record.metadata = self.metadata.clone();
        record
            .metadata
            .entry(TXT_VERSION.to_string())
            .or_insert_with(|| env!("CARGO_PKG_VERSION").to_string());
        record
            .metadata
            .entry(TXT_NODE.to_string())
            .or_insert_with(|| hostname.to_string());
        record
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str("[node]\nport = 7000\n").unwrap();

        assert_eq!(config.node.port, 7000);
        assert_eq!(config.node.service_type, DEFAULT_SERVICE_TYPE);
        assert!(config.node.instance.is_none());
        assert_eq!(config.api.listen, "[::]:8054");
        assert_eq!(config.browser.resolve_attempts, 3);
        assert_eq!(config.announcer.withdraw_timeout_ms, 2000);
        assert!(config.mdns.interface.is_none());
    }

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(
            r#"
            [node]
            instance = "nas"
            service_type = "_files._tcp.local."
            port = 9000
            metadata = { share = "/srv" }

            [mdns]
            interface = "eth0"
            resolve_timeout_ms = 500

            [announcer]
            withdraw_timeout_ms = 250

            [browser]
            resolve_attempts = 5

            [api]
            listen = "127.0.0.1:9100"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.instance.as_deref(), Some("nas"));
        assert_eq!(config.node.metadata.get("share").map(String::as_str), Some("/srv"));
        assert_eq!(config.mdns.interface.as_deref(), Some("eth0"));
        assert_eq!(config.mdns.resolve_timeout_ms, 500);
        assert_eq!(config.mdns.probe_window_ms, 1500);
        assert_eq!(config.announcer.withdraw_timeout_ms, 250);
        assert_eq!(config.browser.resolve_attempts, 5);
        assert_eq!(config.browser.resolve_backoff_ms, 250);
        assert_eq!(config.api.listen, "127.0.0.1:9100");
    }

    #[test]
    fn test_missing_port_rejected() {
        assert!(toml::from_str::<Config>("[node]\ninstance = \"x\"\n").is_err());
    }

    #[test]
    fn test_record_defaults_instance_to_hostname() {
        let config: Config = toml::from_str("[node]\nport = 7000\n").unwrap();
        let record = config.node.record_for_host("box");

        assert_eq!(record.instance, "peer-box");
        assert_eq!(record.port, 7000);
        assert_eq!(record.metadata.get(TXT_NODE).map(String::as_str), Some("box"));
        assert!(record.metadata.contains_key(TXT_VERSION));
    }

    #[test]
    fn test_record_keeps_explicit_metadata() {
        let config: Config = toml::from_str(
            "[node]\ninstance = \"nas\"\nport = 7000\nmetadata = { node = \"custom\" }\n",
        )
        .unwrap();
        let record = config.node.record_for_host("box");

        assert_eq!(record.instance, "nas");
        assert_eq!(record.metadata.get(TXT_NODE).map(String::as_str), Some("custom"));
    }
}
