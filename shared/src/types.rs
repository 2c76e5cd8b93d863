use std::collections::BTreeMap;
use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// A service instance seen on the network.
/// `host` and `addresses` stay empty until the instance has been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    /// Instance name, e.g. "printer"
    pub name: String,

    /// Service type with domain, e.g. "_ipp._tcp.local."
    #[serde(rename = "type")]
    pub service_type: String,

    /// Target host, e.g. "office.local."
    pub host: String,

    /// Addresses of the target host, IPv4 first
    pub addresses: Vec<IpAddr>,

    /// Service port, 0 until resolved
    pub port: u16,

    /// TXT attributes; a key published without `=` maps to `None`
    pub txt: BTreeMap<String, Option<Vec<u8>>>,
}

impl DiscoveredService {
    /// Unique identity of the instance, see [`service_key`].
    pub fn key(&self) -> String {
        service_key(&self.name, &self.service_type)
    }
}

/// Combination of instance name and service type with every literal dot
/// removed, e.g. `printer` + `_ipp._tcp.local.` -> `printer_ipp_tcplocal`.
pub fn service_key(name: &str, service_type: &str) -> String {
    format!("{name}{service_type}").replace('.', "")
}

/// A discovered service as recorded by the daemon and served by its API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Service key, see [`service_key`]
    pub key: String,

    #[serde(flatten)]
    pub service: DiscoveredService,

    /// Whether host, port and addresses have been resolved
    pub resolved: bool,

    /// First time this service was seen
    pub first_seen: DateTime<Utc>,

    /// Last time this service was seen
    pub last_seen: DateTime<Utc>,

    /// Whether the service is currently alive
    pub alive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_strips_dots() {
        assert_eq!(service_key("printer", "_ipp._tcp"), "printer_ipp_tcp");
        assert_eq!(service_key("my.box", "_http._tcp.local."), "mybox_http_tcplocal");
    }

    #[test]
    fn test_service_type_serializes_as_type() {
        let service = DiscoveredService {
            name: "printer".to_string(),
            service_type: "_ipp._tcp.local.".to_string(),
            host: String::new(),
            addresses: Vec::new(),
            port: 0,
            txt: BTreeMap::new(),
        };
        let json = serde_json::to_value(&service).unwrap();
        assert_eq!(json["type"], "_ipp._tcp.local.");
        assert_eq!(service.key(), "printer_ipp_tcplocal");
    }
}
