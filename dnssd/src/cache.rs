use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

use crate::dns::name::canonical;
use crate::dns::{RecordKey, RecordType, ResourceRecord};

/// Fractions of the TTL at which a watched record is re-queried (RFC 6762 section 5.2).
const REFRESH_POINTS: [u32; 4] = [80, 85, 90, 95];

/// Window after which a cache-flush record evicts its older siblings.
const FLUSH_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct CacheEntry {
    record: ResourceRecord,
    expires_at: Instant,
    refreshes_sent: usize,
}

impl CacheEntry {
    fn new(record: ResourceRecord) -> Self {
        Self {
            expires_at: record.expires_at(),
            record,
            refreshes_sent: 0,
        }
    }

    pub fn record(&self) -> &ResourceRecord {
        &self.record
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

/// What a merge did to application-visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added,
    Updated,
    Removed,
    /// Re-announcement of data already cached; only the TTL was refreshed.
    Unchanged,
}

impl Change {
    pub fn is_visible(self) -> bool {
        self != Self::Unchanged
    }
}

#[derive(Debug, Default)]
pub struct RecordCache {
    entries: BTreeMap<RecordKey, CacheEntry>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts or replaces the entry for the record's key. A TTL of 0 removes
    /// the matching entry instead.
    pub fn merge(&mut self, record: ResourceRecord) -> Change {
        let rtype = record.rtype();
        if matches!(rtype, RecordType::Any | RecordType::Other(_)) {
            return Change::Unchanged;
        }

        let key = record.key();
        if record.is_goodbye() {
            return match self.entries.remove(&key) {
                Some(_) => Change::Removed,
                None => Change::Unchanged,
            };
        }

        let flushed = if record.cache_flush() && matches!(rtype, RecordType::A | RecordType::Aaaa) {
            self.flush_siblings(&key, record.received_at())
        } else {
            0
        };

        let change = match self.entries.get(&key) {
            Some(existing) if existing.record.rdata() == record.rdata() => Change::Unchanged,
            Some(_) => Change::Updated,
            None => Change::Added,
        };
        self.entries.insert(key, CacheEntry::new(record));

        if change == Change::Unchanged && flushed > 0 {
            Change::Updated
        } else {
            change
        }
    }

    /// Removes records of the same name and type with a different key that
    /// were received more than a second before `received_at`.
    fn flush_siblings(&mut self, key: &RecordKey, received_at: Instant) -> usize {
        let stale: Vec<RecordKey> = self
            .range(&key.name, key.rtype)
            .filter(|(other, entry)| {
                *other != key && entry.record.received_at() + FLUSH_GRACE <= received_at
            })
            .map(|(other, _)| other.clone())
            .collect();
        for other in &stale {
            self.entries.remove(other);
        }
        stale.len()
    }

    /// Drops every entry whose expiry is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<ResourceRecord> {
        let expired: Vec<RecordKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .map(|entry| entry.record)
            .collect()
    }

    pub fn lookup(&self, name: &str, rtype: RecordType) -> Vec<ResourceRecord> {
        self.range(&canonical(name), rtype)
            .map(|(_, entry)| entry.record.clone())
            .collect()
    }

    pub fn lookup_by_type(&self, rtype: RecordType) -> Vec<ResourceRecord> {
        self.entries
            .iter()
            .filter(|(key, _)| key.rtype == rtype)
            .map(|(_, entry)| entry.record.clone())
            .collect()
    }

    /// Cached answers worth listing in a query for known-answer
    /// suppression: more than half of the TTL left, TTL rewritten to the
    /// remaining lifetime.
    pub fn known_answers(&self, name: &str, rtype: RecordType, now: Instant) -> Vec<ResourceRecord> {
        self.range(&canonical(name), rtype)
            .filter_map(|(_, entry)| {
                let remaining = entry.expires_at.saturating_duration_since(now).as_secs() as u32;
                (remaining > entry.record.ttl() / 2).then(|| entry.record.with_ttl(remaining))
            })
            .collect()
    }

    /// Names and types of watched records that crossed their next refresh
    /// point since the last call. Each point fires at most once per record.
    pub fn refresh_due<F>(&mut self, now: Instant, watched: F) -> Vec<(String, RecordType)>
    where
        F: Fn(&RecordKey) -> bool,
    {
        let mut seen = HashSet::new();
        let mut due = Vec::new();
        for (key, entry) in self.entries.iter_mut() {
            if entry.refreshes_sent >= REFRESH_POINTS.len() || !watched(key) {
                continue;
            }
            let ttl = Duration::from_secs(u64::from(entry.record.ttl()));
            let elapsed = now.saturating_duration_since(entry.record.received_at());
            let mut crossed = false;
            while entry.refreshes_sent < REFRESH_POINTS.len()
                && elapsed >= ttl * REFRESH_POINTS[entry.refreshes_sent] / 100
            {
                entry.refreshes_sent += 1;
                crossed = true;
            }
            if crossed && seen.insert((key.name.clone(), key.rtype)) {
                due.push((entry.record.name().to_string(), key.rtype));
            }
        }
        due
    }

    fn range<'a>(
        &'a self,
        name: &'a str,
        rtype: RecordType,
    ) -> impl Iterator<Item = (&'a RecordKey, &'a CacheEntry)> + 'a {
        let start = RecordKey {
            name: name.to_string(),
            rtype,
            rdata: String::new(),
        };
        self.entries
            .range(start..)
            .take_while(move |(key, _)| key.name == name && key.rtype == rtype)
    }
}
