use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{Context, Result};
use dnssd::EngineConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub publish: Vec<PublishConfig>,
    #[serde(default)]
    pub browse: BrowseConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// One `[[publish]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    /// Instance name; defaults to the system host name
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub service_type: String,
    pub port: u16,
    #[serde(default)]
    pub txt: BTreeMap<String, String>,
    /// TXT keys published without a value
    #[serde(default)]
    pub flags: Vec<String>,
    /// Addresses to publish instead of the interface addresses
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
    #[serde(default = "default_register_timeout")]
    pub register_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowseConfig {
    #[serde(default)]
    pub types: Vec<String>,
    /// Resolve every discovered instance as soon as it shows up
    #[serde(default = "default_true")]
    pub resolve: bool,
    /// Ceiling for the delay between attempts to browse again after the
    /// transport was lost
    #[serde(default = "default_rebrowse_max_backoff")]
    pub rebrowse_max_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Dead services are deleted once they have not been seen for this long
    #[serde(default = "default_prune_after")]
    pub prune_after_secs: u64,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Publish the API itself as a DNS-SD service
    #[serde(default)]
    pub advertise: bool,
}

fn default_register_timeout() -> u64 {
    dnssd::DEFAULT_REGISTER_TIMEOUT.as_millis() as u64
}

fn default_true() -> bool {
    true
}

fn default_rebrowse_max_backoff() -> u64 {
    60
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/dnssd/services.db")
}

fn default_prune_after() -> u64 {
    3600
}

fn default_maintenance_interval() -> u64 {
    60
}

fn default_listen() -> String {
    "[::]:8053".to_string()
}

impl Default for BrowseConfig {
    fn default() -> Self {
        Self {
            types: Vec::new(),
            resolve: default_true(),
            rebrowse_max_backoff_secs: default_rebrowse_max_backoff(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            prune_after_secs: default_prune_after(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            advertise: false,
        }
    }
}

impl ApiConfig {
    /// Port part of the listen address, used when advertising the API.
    pub fn port(&self) -> Option<u16> {
        self.listen.rsplit(':').next().and_then(|s| s.parse().ok())
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
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.publish.is_empty());
        assert!(config.browse.resolve);
        assert_eq!(config.engine.port, 5353);
        assert_eq!(config.store.prune_after_secs, 3600);
        assert_eq!(config.api.port(), Some(8053));
    }

    #[test]
    fn test_full_file() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            host_name = "office"
            ipv6 = true

            [[publish]]
            name = "printer"
            type = "_ipp._tcp"
            port = 631
            flags = ["color"]

            [publish.txt]
            rp = "ipp/print"

            [[publish]]
            type = "_ssh._tcp"
            port = 22

            [browse]
            types = ["_ipp._tcp", "_http._tcp.local."]
            resolve = false

            [store]
            db_path = "/tmp/services.db"

            [api]
            listen = "127.0.0.1:9000"
            advertise = true
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.host_name.as_deref(), Some("office"));
        assert!(config.engine.ipv6);
        assert_eq!(config.publish.len(), 2);
        assert_eq!(config.publish[0].txt.get("rp").map(String::as_str), Some("ipp/print"));
        assert_eq!(config.publish[0].flags, vec!["color"]);
        assert_eq!(config.publish[1].name, None);
        assert_eq!(config.publish[1].register_timeout_ms, 10_000);
        assert_eq!(config.browse.types.len(), 2);
        assert!(!config.browse.resolve);
        assert_eq!(config.store.db_path, PathBuf::from("/tmp/services.db"));
        assert_eq!(config.api.port(), Some(9000));
        assert!(config.api.advertise);
    }
}
