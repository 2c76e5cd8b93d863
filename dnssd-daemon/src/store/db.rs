use std::path::Path;
use anyhow::{Context, Result};
use rusqlite::{Connection, params, OptionalExtension};
use shared::types::{DiscoveredService, ServiceEntry};
use chrono::Utc;

const COLUMNS: &str = "key, name, service_type, host, addresses, port, txt,
                       resolved, first_seen, last_seen, alive";

pub struct ServiceStore {
    conn: Connection,
}

impl ServiceStore {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS services (
                key           TEXT PRIMARY KEY,
                name          TEXT NOT NULL,
                service_type  TEXT NOT NULL,
                host          TEXT NOT NULL,
                addresses     TEXT NOT NULL,
                port          INTEGER NOT NULL,
                txt           TEXT NOT NULL,
                resolved      INTEGER NOT NULL DEFAULT 0,
                first_seen    TEXT NOT NULL,
                last_seen     TEXT NOT NULL,
                alive         INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX IF NOT EXISTS idx_service_type ON services(service_type);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Record a sighting of `service`. A resolved sighting replaces host,
    /// port, addresses and TXT; an unresolved one keeps what an earlier
    /// resolve stored. Returns true if data changed.
    pub fn record(&self, service: &DiscoveredService, resolved: bool) -> Result<bool> {
        let key = service.key();
        let existing = self.get_service(&key)?;
        let now = Utc::now();

        let entry = match existing.as_ref() {
            Some(old) if old.resolved && !resolved => ServiceEntry {
                last_seen: now,
                alive: true,
                ..old.clone()
            },
            Some(old) => ServiceEntry {
                key,
                service: service.clone(),
                resolved,
                first_seen: old.first_seen,
                last_seen: now,
                alive: true,
            },
            None => ServiceEntry {
                key,
                service: service.clone(),
                resolved,
                first_seen: now,
                last_seen: now,
                alive: true,
            },
        };

        let changed = match &existing {
            Some(old) => service_data_changed(old, &entry),
            None => true,
        };

        self.upsert_entry(&entry)?;
        Ok(changed)
    }

    fn upsert_entry(&self, entry: &ServiceEntry) -> Result<()> {
        let addresses_json = serde_json::to_string(&entry.service.addresses)
            .context("Failed to serialize addresses")?;
        let txt_json = serde_json::to_string(&entry.service.txt)
            .context("Failed to serialize txt records")?;

        self.conn.execute(
            r#"
            INSERT INTO services (
                key, name, service_type, host, addresses, port, txt,
                resolved, first_seen, last_seen, alive
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(key) DO UPDATE SET
                name = excluded.name,
                service_type = excluded.service_type,
                host = excluded.host,
                addresses = excluded.addresses,
                port = excluded.port,
                txt = excluded.txt,
                resolved = excluded.resolved,
                last_seen = excluded.last_seen,
                alive = excluded.alive
            "#,
            params![
                &entry.key,
                &entry.service.name,
                &entry.service.service_type,
                &entry.service.host,
                &addresses_json,
                entry.service.port,
                &txt_json,
                entry.resolved as i32,
                entry.first_seen.to_rfc3339(),
                entry.last_seen.to_rfc3339(),
                entry.alive as i32,
            ],
        )
        .context("Failed to upsert service")?;

        Ok(())
    }

    /// Mark a service as dead. Returns true if it was alive.
    pub fn mark_dead(&self, key: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let count = self.conn.execute(
            "UPDATE services SET alive = 0, last_seen = ?1 WHERE key = ?2 AND alive = 1",
            params![now, key],
        )
        .context("Failed to mark service as dead")?;
        Ok(count > 0)
    }

    /// Mark every live service of one type dead; `None` marks all of them.
    pub fn mark_all_dead(&self, service_type: Option<&str>) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let count = match service_type {
            Some(service_type) => self.conn.execute(
                "UPDATE services SET alive = 0, last_seen = ?1 WHERE service_type = ?2 AND alive = 1",
                params![now, service_type],
            ),
            None => self.conn.execute(
                "UPDATE services SET alive = 0, last_seen = ?1 WHERE alive = 1",
                params![now],
            ),
        }
        .context("Failed to mark services as dead")?;
        Ok(count as u64)
    }

    /// Get all services
    pub fn get_all_services(&self) -> Result<Vec<ServiceEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {COLUMNS} FROM services ORDER BY key"))
            .context("Failed to prepare query")?;

        let services = stmt
            .query_map([], Self::row_to_entry)
            .context("Failed to query services")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect services")?;

        Ok(services)
    }

    /// Get services filtered by type, e.g. `_ipp._tcp.local.`
    pub fn get_services_by_type(&self, service_type: &str) -> Result<Vec<ServiceEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM services WHERE service_type = ?1 ORDER BY key"
            ))
            .context("Failed to prepare query")?;

        let services = stmt
            .query_map([service_type], Self::row_to_entry)
            .context("Failed to query services by type")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect services")?;

        Ok(services)
    }

    /// Get a single service by key
    pub fn get_service(&self, key: &str) -> Result<Option<ServiceEntry>> {
        let result = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM services WHERE key = ?1"),
                params![key],
                Self::row_to_entry,
            )
            .optional()
            .context("Failed to query service")?;

        Ok(result)
    }

    /// Delete dead services not seen for `prune_after_secs`
    pub fn prune_dead(&self, prune_after_secs: u64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(prune_after_secs as i64);
        let cutoff_str = cutoff.to_rfc3339();

        let count = self.conn.execute(
            "DELETE FROM services WHERE alive = 0 AND last_seen < ?1",
            params![cutoff_str],
        )
        .context("Failed to prune dead services")?;

        Ok(count as u64)
    }

    fn row_to_entry(row: &rusqlite::Row) -> Result<ServiceEntry, rusqlite::Error> {
        let addresses_json: String = row.get(4)?;
        let txt_json: String = row.get(6)?;
        let resolved_int: i32 = row.get(7)?;
        let first_seen_str: String = row.get(8)?;
        let last_seen_str: String = row.get(9)?;
        let alive_int: i32 = row.get(10)?;

        let addresses = serde_json::from_str(&addresses_json)
            .map_err(|e| conversion_failure(4, e))?;
        let txt = serde_json::from_str(&txt_json)
            .map_err(|e| conversion_failure(6, e))?;
        let first_seen = chrono::DateTime::parse_from_rfc3339(&first_seen_str)
            .map_err(|e| conversion_failure(8, e))?
            .with_timezone(&Utc);
        let last_seen = chrono::DateTime::parse_from_rfc3339(&last_seen_str)
            .map_err(|e| conversion_failure(9, e))?
            .with_timezone(&Utc);

        Ok(ServiceEntry {
            key: row.get(0)?,
            service: DiscoveredService {
                name: row.get(1)?,
                service_type: row.get(2)?,
                host: row.get(3)?,
                addresses,
                port: row.get::<_, u16>(5)?,
                txt,
            },
            resolved: resolved_int != 0,
            first_seen,
            last_seen,
            alive: alive_int != 0,
        })
    }
}

fn conversion_failure(
    column: usize,
    error: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(error))
}

/// Timestamps move on every sighting and are not a change of the service.
fn service_data_changed(old: &ServiceEntry, new: &ServiceEntry) -> bool {
    old.service != new.service || old.resolved != new.resolved || old.alive != new.alive
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn discovered(name: &str, service_type: &str) -> DiscoveredService {
        DiscoveredService {
            name: name.to_string(),
            service_type: service_type.to_string(),
            host: String::new(),
            addresses: Vec::new(),
            port: 0,
            txt: BTreeMap::new(),
        }
    }

    fn resolved(name: &str) -> DiscoveredService {
        DiscoveredService {
            host: "office.local.".to_string(),
            addresses: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))],
            port: 631,
            txt: BTreeMap::from([
                ("rp".to_string(), Some(b"ipp/print".to_vec())),
                ("color".to_string(), None),
            ]),
            ..discovered(name, "_ipp._tcp.local.")
        }
    }

    #[test]
    fn test_record_and_query() {
        let store = ServiceStore::open(":memory:").unwrap();
        let service = resolved("printer");

        assert!(store.record(&service, true).unwrap(), "First insert should report change");

        let entry = store.get_service("printer_ipp_tcplocal").unwrap().unwrap();
        assert_eq!(entry.service, service);
        assert!(entry.resolved);
        assert!(entry.alive);
    }

    #[test]
    fn test_record_detects_changes() {
        let store = ServiceStore::open(":memory:").unwrap();
        let mut service = resolved("printer");

        store.record(&service, true).unwrap();
        assert!(!store.record(&service, true).unwrap(), "Identical record should not report change");

        service.port = 8631;
        assert!(store.record(&service, true).unwrap(), "Modified service should report change");
    }

    #[test]
    fn test_unresolved_sighting_keeps_resolved_data() {
        let store = ServiceStore::open(":memory:").unwrap();
        let service = resolved("printer");
        store.record(&service, true).unwrap();
        let first = store.get_service(&service.key()).unwrap().unwrap();

        let changed = store.record(&discovered("printer", "_ipp._tcp.local."), false).unwrap();
        assert!(!changed);
        let entry = store.get_service(&service.key()).unwrap().unwrap();
        assert_eq!(entry.service.port, 631);
        assert!(entry.resolved);
        assert_eq!(entry.first_seen, first.first_seen);
    }

    #[test]
    fn test_mark_dead_and_revive() {
        let store = ServiceStore::open(":memory:").unwrap();
        let service = resolved("printer");
        store.record(&service, true).unwrap();

        assert!(store.mark_dead(&service.key()).unwrap());
        assert!(!store.mark_dead(&service.key()).unwrap(), "Already dead");
        assert!(!store.get_service(&service.key()).unwrap().unwrap().alive);

        assert!(store.record(&service, true).unwrap(), "Coming back is a change");
        assert!(store.get_service(&service.key()).unwrap().unwrap().alive);
    }

    #[test]
    fn test_mark_all_dead_by_type() {
        let store = ServiceStore::open(":memory:").unwrap();
        store.record(&resolved("a"), true).unwrap();
        store.record(&resolved("b"), true).unwrap();
        store.record(&discovered("box", "_ssh._tcp.local."), false).unwrap();

        assert_eq!(store.mark_all_dead(Some("_ipp._tcp.local.")).unwrap(), 2);
        assert!(store.get_service("box_ssh_tcplocal").unwrap().unwrap().alive);
        assert_eq!(store.mark_all_dead(None).unwrap(), 1);
    }

    #[test]
    fn test_get_services_by_type() {
        let store = ServiceStore::open(":memory:").unwrap();
        store.record(&resolved("a"), true).unwrap();
        store.record(&resolved("b"), true).unwrap();
        store.record(&discovered("box", "_ssh._tcp.local."), false).unwrap();

        assert_eq!(store.get_services_by_type("_ipp._tcp.local.").unwrap().len(), 2);
        assert_eq!(store.get_services_by_type("_ssh._tcp.local.").unwrap().len(), 1);
        assert_eq!(store.get_all_services().unwrap().len(), 3);
    }

    #[test]
    fn test_prune_only_removes_dead() {
        let store = ServiceStore::open(":memory:").unwrap();
        store.record(&resolved("a"), true).unwrap();
        store.record(&resolved("b"), true).unwrap();
        store.mark_dead("a_ipp_tcplocal").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));

        assert_eq!(store.prune_dead(0).unwrap(), 1);
        assert!(store.get_service("a_ipp_tcplocal").unwrap().is_none());
        assert!(store.get_service("b_ipp_tcplocal").unwrap().is_some());
    }
}
