use std::time::Duration;
use serde::Deserialize;
use shared::protocol::{DEFAULT_DOMAIN, MDNS_PORT, PTR_TTL_SECS, RECORD_TTL_SECS};

/// Engine settings. Every field has a default so an empty TOML table is a
/// valid configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub ipv4: bool,
    #[serde(default)]
    pub ipv6: bool,
    /// Interface names to join the group on; empty means every non-loopback interface
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Host name used as SRV target; defaults to the system host name
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default = "default_domain")]
    pub domain: String,

    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_probe_count")]
    pub probe_count: u8,
    #[serde(default = "default_max_renames")]
    pub max_rename_attempts: u32,
    #[serde(default = "default_announce_count")]
    pub announce_count: u8,
    #[serde(default = "default_announce_interval")]
    pub announce_interval_ms: u64,
    #[serde(default = "default_update_coalesce")]
    pub update_coalesce_ms: u64,
    #[serde(default = "default_record_ttl")]
    pub record_ttl_secs: u32,
    #[serde(default = "default_ptr_ttl")]
    pub ptr_ttl_secs: u32,
    #[serde(default = "default_register_timeout")]
    pub register_timeout_ms: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_query_initial")]
    pub query_initial_interval_ms: u64,
    #[serde(default = "default_query_max")]
    pub query_max_interval_secs: u64,
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_ms: u64,

    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_reopen_max_backoff")]
    pub reopen_max_backoff_secs: u64,
}

fn default_port() -> u16 {
    MDNS_PORT
}

fn default_true() -> bool {
    true
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_probe_interval() -> u64 {
    250
}

fn default_probe_count() -> u8 {
    3
}

fn default_max_renames() -> u32 {
    15
}

fn default_announce_count() -> u8 {
    2
}

fn default_announce_interval() -> u64 {
    1000
}

fn default_update_coalesce() -> u64 {
    100
}

fn default_record_ttl() -> u32 {
    RECORD_TTL_SECS
}

fn default_ptr_ttl() -> u32 {
    PTR_TTL_SECS
}

fn default_register_timeout() -> u64 {
    10_000
}

fn default_sweep_interval() -> u64 {
    1000
}

fn default_query_initial() -> u64 {
    1000
}

fn default_query_max() -> u64 {
    3600
}

fn default_resolve_timeout() -> u64 {
    5000
}

fn default_send_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    50
}

fn default_reopen_max_backoff() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            ipv4: default_true(),
            ipv6: false,
            interfaces: Vec::new(),
            host_name: None,
            domain: default_domain(),
            probe_interval_ms: default_probe_interval(),
            probe_count: default_probe_count(),
            max_rename_attempts: default_max_renames(),
            announce_count: default_announce_count(),
            announce_interval_ms: default_announce_interval(),
            update_coalesce_ms: default_update_coalesce(),
            record_ttl_secs: default_record_ttl(),
            ptr_ttl_secs: default_ptr_ttl(),
            register_timeout_ms: default_register_timeout(),
            sweep_interval_ms: default_sweep_interval(),
            query_initial_interval_ms: default_query_initial(),
            query_max_interval_secs: default_query_max(),
            resolve_timeout_ms: default_resolve_timeout(),
            send_retries: default_send_retries(),
            retry_backoff_ms: default_retry_backoff(),
            reopen_max_backoff_secs: default_reopen_max_backoff(),
        }
    }
}

impl EngineConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn update_coalesce(&self) -> Duration {
        Duration::from_millis(self.update_coalesce_ms)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn query_initial_interval(&self) -> Duration {
        Duration::from_millis(self.query_initial_interval_ms.max(1))
    }

    pub fn query_max_interval(&self) -> Duration {
        Duration::from_secs(self.query_max_interval_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn reopen_max_backoff(&self) -> Duration {
        Duration::from_secs(self.reopen_max_backoff_secs)
    }

    /// Re-announcement period: half the shortest published TTL.
    pub fn reannounce_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.record_ttl_secs.min(self.ptr_ttl_secs).max(2)) / 2)
    }
}
