use std::collections::BTreeMap;
use std::net::IpAddr;
use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::ServiceEntry;

/// Hash only what a client would render; first_seen/last_seen move on
/// every sighting without the service changing.
#[derive(Serialize)]
struct HashView<'a> {
    key: &'a str,
    name: &'a str,
    service_type: &'a str,
    host: &'a str,
    addresses: &'a [IpAddr],
    port: u16,
    txt: &'a BTreeMap<String, Option<Vec<u8>>>,
    resolved: bool,
    alive: bool,
}

/// Computes a SHA-256 hash of the service list.
/// Services are sorted by key for deterministic output.
pub fn compute_hash(services: &[ServiceEntry]) -> String {
    let mut indices: Vec<usize> = (0..services.len()).collect();
    indices.sort_by(|&a, &b| services[a].key.cmp(&services[b].key));

    let mut hasher = Sha256::new();
    for &i in &indices {
        let s = &services[i];
        let view = HashView {
            key: &s.key,
            name: &s.service.name,
            service_type: &s.service.service_type,
            host: &s.service.host,
            addresses: &s.service.addresses,
            port: s.service.port,
            txt: &s.service.txt,
            resolved: s.resolved,
            alive: s.alive,
        };
        // Serializing plain strings, numbers and maps with string keys cannot fail.
        if let Ok(json) = serde_json::to_vec(&view) {
            hasher.update(&json);
            hasher.update(b"\n");
        }
    }

    hex::encode(hasher.finalize())
}
