use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use shared::types::DiscoveredService;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::browse::{DiscoveryEvent, Resolver};
use crate::cache::RecordCache;
use crate::config::EngineConfig;
use crate::dns::name::{canonical, from_labels, labels};
use crate::dns::{Message, Question, RData, RecordType, ResourceRecord};
use crate::engine::Command;
use crate::error::{Error, Result};
use crate::schedule::{BrowseId, Outbox, Timer};

/// Everything the cache knows about one instance.
struct View {
    service: DiscoveredService,
    complete: bool,
}

/// `fullname` and `ty_domain` are canonical and only used for lookups; the
/// service carries the spelling the publisher used.
fn view(cache: &RecordCache, fullname: &str, ty_domain: &str) -> View {
    let spelled = labels(&spelling(cache, fullname, ty_domain));
    let name = spelled.first().cloned().unwrap_or_default();
    let mut service = DiscoveredService {
        name,
        service_type: from_labels(spelled.get(1..).unwrap_or_default()),
        host: String::new(),
        addresses: Vec::new(),
        port: 0,
        txt: BTreeMap::new(),
    };
    let srv = cache.lookup(fullname, RecordType::Srv).into_iter().next();
    let txt = cache.lookup(fullname, RecordType::Txt).into_iter().next();
    if let Some(RData::Txt(pairs)) = txt.as_ref().map(|r| r.rdata()) {
        service.txt = RData::txt_map(pairs);
    }
    if let Some(RData::Srv { port, target, .. }) = srv.as_ref().map(|r| r.rdata()) {
        service.port = *port;
        service.host = target.clone();
        service.addresses = addresses(cache, target);
    }
    let complete = srv.is_some() && txt.is_some() && !service.addresses.is_empty();
    View { service, complete }
}

/// Instance name as written in the PTR rdata, else as the SRV owner.
fn spelling(cache: &RecordCache, fullname: &str, ty_domain: &str) -> String {
    cache
        .lookup(ty_domain, RecordType::Ptr)
        .into_iter()
        .find_map(|r| match r.rdata() {
            RData::Ptr(target) if canonical(target) == fullname => Some(target.clone()),
            _ => None,
        })
        .or_else(|| {
            cache
                .lookup(fullname, RecordType::Srv)
                .into_iter()
                .next()
                .map(|r| r.name().to_string())
        })
        .unwrap_or_else(|| fullname.to_string())
}

/// A PTR for the instance is cached under its type.
fn advertised(cache: &RecordCache, fullname: &str) -> bool {
    cache
        .lookup(&parent(fullname), RecordType::Ptr)
        .iter()
        .any(|r| matches!(r.rdata(), RData::Ptr(target) if canonical(target) == fullname))
}

fn addresses(cache: &RecordCache, host: &str) -> Vec<IpAddr> {
    cache
        .lookup(host, RecordType::A)
        .into_iter()
        .chain(cache.lookup(host, RecordType::Aaaa))
        .filter_map(|r| match r.rdata() {
            RData::A(ip) => Some(IpAddr::V4(*ip)),
            RData::Aaaa(ip) => Some(IpAddr::V6(*ip)),
            _ => None,
        })
        .collect()
}

/// `<service>.<domain>` part of an instance name.
fn parent(fullname: &str) -> String {
    let labels = labels(fullname);
    canonical(&from_labels(labels.get(1..).unwrap_or_default()))
}

fn srv_target(cache: &RecordCache, fullname: &str) -> Option<String> {
    cache
        .lookup(fullname, RecordType::Srv)
        .into_iter()
        .find_map(|r| match r.rdata() {
            RData::Srv { target, .. } => Some(canonical(target)),
            _ => None,
        })
}

/// Where a service key points, in canonical form.
#[derive(Debug, Clone)]
struct Instance {
    fullname: String,
    ty_domain: String,
}

struct Known {
    resolve_requested: bool,
    last_view: DiscoveredService,
    last_resolved: Option<DiscoveredService>,
}

struct BrowseSession {
    ty_domain: String,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    /// Instances this session has reported, by canonical full name.
    known: HashMap<String, Known>,
}

struct OutstandingQuery {
    refs: usize,
    interval: Duration,
}

struct PendingResolve {
    key: String,
    ty_domain: String,
    waiters: Vec<oneshot::Sender<Result<DiscoveredService>>>,
    /// Browse sessions whose resolver started or joined this resolve.
    sessions: BTreeSet<BrowseId>,
    asked_host: Option<String>,
}

/// Browse sessions for one type share a single PTR query. Its interval
/// doubles from one second up to an hour and resets when the cache changes.
pub(crate) struct QueryEngine {
    config: Arc<EngineConfig>,
    commands: mpsc::WeakUnboundedSender<Command>,
    sessions: BTreeMap<BrowseId, BrowseSession>,
    queries: HashMap<String, OutstandingQuery>,
    resolves: HashMap<String, PendingResolve>,
    /// Service keys of instances a browse has reported. An entry goes once
    /// the instance's PTR is gone and no session or resolve refers to it.
    directory: HashMap<String, Instance>,
}

impl QueryEngine {
    pub fn new(config: Arc<EngineConfig>, commands: mpsc::WeakUnboundedSender<Command>) -> Self {
        Self {
            config,
            commands,
            sessions: BTreeMap::new(),
            queries: HashMap::new(),
            resolves: HashMap::new(),
            directory: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    #[cfg(test)]
    pub fn knows_key(&self, key: &str) -> bool {
        self.directory.contains_key(key)
    }

    /// Starts a session for `ty_domain`. Instances already in the cache are
    /// reported right away.
    pub fn browse(
        &mut self,
        id: BrowseId,
        ty_domain: &str,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
        cache: &RecordCache,
        now: Instant,
        out: &mut Outbox,
    ) {
        let ty_domain = canonical(ty_domain);
        self.sessions.insert(
            id,
            BrowseSession {
                ty_domain: ty_domain.clone(),
                events,
                known: HashMap::new(),
            },
        );
        let cached: Vec<String> = cache
            .lookup(&ty_domain, RecordType::Ptr)
            .into_iter()
            .filter_map(|r| match r.rdata() {
                RData::Ptr(target) => Some(canonical(target)),
                _ => None,
            })
            .collect();
        for fullname in cached {
            self.sync_instance(id, &fullname, cache);
        }

        let initial = self.config.query_initial_interval();
        let query = self.queries.entry(ty_domain.clone()).or_insert(OutstandingQuery {
            refs: 0,
            interval: initial,
        });
        query.refs += 1;
        if query.refs == 1 {
            tracing::debug!("Starting query for {}", ty_domain);
            Self::send_browse_query(&ty_domain, cache, now, out);
            out.schedule(Timer::Query(ty_domain), initial);
        }
    }

    pub fn stop_browse(&mut self, id: BrowseId, out: &mut Outbox) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        if let Some(query) = self.queries.get_mut(&session.ty_domain) {
            query.refs -= 1;
            if query.refs == 0 {
                self.queries.remove(&session.ty_domain);
                out.cancel(Timer::Query(session.ty_domain.clone()));
                tracing::debug!("Stopped query for {}", session.ty_domain);
            }
        }
        let abandoned: Vec<String> = self
            .resolves
            .iter_mut()
            .filter_map(|(fullname, pending)| {
                pending.sessions.remove(&id);
                (pending.sessions.is_empty() && pending.waiters.is_empty()).then(|| fullname.clone())
            })
            .collect();
        for fullname in abandoned {
            self.resolves.remove(&fullname);
            out.cancel(Timer::ResolveRetry(fullname.clone()));
            out.cancel(Timer::ResolveDeadline(fullname));
        }
    }

    pub fn on_query_timer(&mut self, ty_domain: &str, cache: &RecordCache, now: Instant, out: &mut Outbox) {
        let ceiling = self.config.query_max_interval();
        let Some(query) = self.queries.get_mut(ty_domain) else {
            return;
        };
        Self::send_browse_query(ty_domain, cache, now, out);
        query.interval = (query.interval * 2).min(ceiling);
        out.schedule(Timer::Query(ty_domain.to_string()), query.interval);
    }

    fn send_browse_query(ty_domain: &str, cache: &RecordCache, now: Instant, out: &mut Outbox) {
        let mut query = Message::query();
        query.questions.push(Question::new(ty_domain, RecordType::Ptr));
        query.answers = cache.known_answers(ty_domain, RecordType::Ptr, now);
        out.multicast(query);
    }

    /// Caller-side resolve by service key.
    pub fn resolve(
        &mut self,
        key: &str,
        reply: oneshot::Sender<Result<DiscoveredService>>,
        cache: &RecordCache,
        now: Instant,
        out: &mut Outbox,
    ) {
        let Some(instance) = self.directory.get(key).cloned() else {
            let _ = reply.send(Err(Error::UnknownService(key.to_string())));
            return;
        };
        let current = view(cache, &instance.fullname, &instance.ty_domain);
        if current.complete {
            let _ = reply.send(Ok(current.service));
            return;
        }
        self.pending(key, &instance, cache, now, out).waiters.push(reply);
    }

    /// Resolve started through a [`Resolver`] of session `browse`.
    pub fn resolve_for(&mut self, browse: BrowseId, key: &str, cache: &RecordCache, now: Instant, out: &mut Outbox) {
        let Some(instance) = self.directory.get(key).cloned() else {
            tracing::debug!("Ignoring resolve of unknown service {}", key);
            return;
        };
        let resolver = self.resolver(browse, key);
        let Some(session) = self.sessions.get_mut(&browse) else {
            return;
        };
        let Some(known) = session.known.get_mut(&instance.fullname) else {
            return;
        };
        known.resolve_requested = true;
        let current = view(cache, &instance.fullname, &instance.ty_domain);
        if current.complete {
            known.last_resolved = Some(current.service.clone());
            let _ = session.events.send(DiscoveryEvent::Resolved {
                service: current.service,
                resolver,
            });
            return;
        }
        self.pending(key, &instance, cache, now, out).sessions.insert(browse);
    }

    fn pending(
        &mut self,
        key: &str,
        instance: &Instance,
        cache: &RecordCache,
        now: Instant,
        out: &mut Outbox,
    ) -> &mut PendingResolve {
        let retry = self.config.query_initial_interval();
        let timeout = self.config.resolve_timeout();
        match self.resolves.entry(instance.fullname.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let fullname = entry.key().clone();
                tracing::debug!("Resolving {}", fullname);
                let mut pending = PendingResolve {
                    key: key.to_string(),
                    ty_domain: instance.ty_domain.clone(),
                    waiters: Vec::new(),
                    sessions: BTreeSet::new(),
                    asked_host: None,
                };
                Self::send_resolve_query(&fullname, &mut pending, cache, now, out);
                out.schedule(Timer::ResolveRetry(fullname.clone()), retry);
                out.schedule(Timer::ResolveDeadline(fullname), timeout);
                entry.insert(pending)
            }
        }
    }

    fn send_resolve_query(
        fullname: &str,
        pending: &mut PendingResolve,
        cache: &RecordCache,
        now: Instant,
        out: &mut Outbox,
    ) {
        let mut query = Message::query();
        for rtype in [RecordType::Srv, RecordType::Txt] {
            query.questions.push(Question::new(fullname, rtype));
            query.answers.extend(cache.known_answers(fullname, rtype, now));
        }
        if let Some(host) = srv_target(cache, fullname) {
            for rtype in [RecordType::A, RecordType::Aaaa] {
                query.questions.push(Question::new(host.clone(), rtype));
                query.answers.extend(cache.known_answers(&host, rtype, now));
            }
            pending.asked_host = Some(host);
        }
        out.multicast(query);
    }

    pub fn on_resolve_retry(&mut self, fullname: &str, cache: &RecordCache, now: Instant, out: &mut Outbox) {
        let interval = self.config.query_initial_interval();
        if let Some(pending) = self.resolves.get_mut(fullname) {
            Self::send_resolve_query(fullname, pending, cache, now, out);
            out.schedule(Timer::ResolveRetry(fullname.to_string()), interval);
        }
    }

    pub fn on_resolve_deadline(&mut self, fullname: &str, cache: &RecordCache, out: &mut Outbox) {
        let Some(pending) = self.resolves.remove(fullname) else {
            return;
        };
        out.cancel(Timer::ResolveRetry(fullname.to_string()));
        let timeout = self.config.resolve_timeout();
        tracing::debug!("Resolve of {} timed out", fullname);
        for waiter in pending.waiters {
            let _ = waiter.send(Err(Error::ResolveTimeout {
                key: pending.key.clone(),
                timeout,
            }));
        }
        let current = view(cache, fullname, &pending.ty_domain);
        for browse in pending.sessions {
            let resolver = self.resolver(browse, &pending.key);
            if let Some(session) = self.sessions.get(&browse) {
                if session.known.contains_key(fullname) {
                    let _ = session.events.send(DiscoveryEvent::ResolveTimedOut {
                        service: current.service.clone(),
                        resolver,
                    });
                }
            }
        }
        self.forget_if_gone(fullname, cache);
    }

    /// Brings sessions and pending resolves up to date with records that were
    /// added, changed or removed.
    pub fn reconcile(&mut self, cache: &RecordCache, touched: &[ResourceRecord], now: Instant, out: &mut Outbox) {
        if touched.is_empty() {
            return;
        }
        let mut affected = BTreeSet::new();
        let mut ptr_owners = HashSet::new();
        for record in touched {
            let name = canonical(record.name());
            match record.rdata() {
                RData::Ptr(target) => {
                    affected.insert(canonical(target));
                    ptr_owners.insert(name);
                }
                RData::Srv { .. } | RData::Txt(_) => {
                    affected.insert(name);
                }
                RData::A(_) | RData::Aaaa(_) => affected.extend(self.instances_on_host(cache, &name)),
                RData::Other { .. } => {}
            }
        }

        let initial = self.config.query_initial_interval();
        for owner in ptr_owners {
            if let Some(query) = self.queries.get_mut(&owner) {
                query.interval = initial;
                out.schedule(Timer::Query(owner), initial);
            }
        }

        let ids: Vec<BrowseId> = self.sessions.keys().copied().collect();
        for fullname in &affected {
            for id in &ids {
                self.sync_instance(*id, fullname, cache);
            }
            self.check_resolve(fullname, cache, now, out);
            self.forget_if_gone(fullname, cache);
        }
    }

    fn forget_if_gone(&mut self, fullname: &str, cache: &RecordCache) {
        let referenced = self.resolves.contains_key(fullname)
            || self.sessions.values().any(|s| s.known.contains_key(fullname));
        if referenced || advertised(cache, fullname) {
            return;
        }
        let before = self.directory.len();
        self.directory.retain(|_, instance| instance.fullname != fullname);
        if self.directory.len() < before {
            tracing::trace!("Forgot key of {}", fullname);
        }
    }

    fn sync_instance(&mut self, id: BrowseId, fullname: &str, cache: &RecordCache) {
        let Some(ty_domain) = self.sessions.get(&id).map(|s| s.ty_domain.clone()) else {
            return;
        };
        if parent(fullname) != ty_domain {
            return;
        }
        let present = advertised(cache, fullname);
        let current = view(cache, fullname, &ty_domain);
        let key = current.service.key();
        let resolver = self.resolver(id, &key);
        if present {
            self.directory.insert(
                key.clone(),
                Instance {
                    fullname: fullname.to_string(),
                    ty_domain: ty_domain.clone(),
                },
            );
        }
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };

        let event = match (present, session.known.get_mut(fullname)) {
            (true, None) => {
                session.known.insert(
                    fullname.to_string(),
                    Known {
                        resolve_requested: false,
                        last_view: current.service.clone(),
                        last_resolved: None,
                    },
                );
                Some(DiscoveryEvent::Discovered {
                    service: current.service,
                    resolver,
                })
            }
            (true, Some(known)) => {
                known.last_view = current.service.clone();
                let changed = known.last_resolved.as_ref() != Some(&current.service);
                if known.resolve_requested && current.complete && changed {
                    known.last_resolved = Some(current.service.clone());
                    Some(DiscoveryEvent::Resolved {
                        service: current.service,
                        resolver,
                    })
                } else {
                    None
                }
            }
            (false, Some(_)) => session.known.remove(fullname).map(|known| DiscoveryEvent::Removed {
                service: known.last_view,
            }),
            (false, None) => None,
        };
        if let Some(event) = event {
            let _ = session.events.send(event);
        }
    }

    fn check_resolve(&mut self, fullname: &str, cache: &RecordCache, now: Instant, out: &mut Outbox) {
        let Some(pending) = self.resolves.get_mut(fullname) else {
            return;
        };
        let current = view(cache, fullname, &pending.ty_domain);
        if !current.complete {
            let host = srv_target(cache, fullname);
            if host.is_some() && pending.asked_host != host {
                Self::send_resolve_query(fullname, pending, cache, now, out);
            }
            return;
        }

        let Some(pending) = self.resolves.remove(fullname) else {
            return;
        };
        out.cancel(Timer::ResolveRetry(fullname.to_string()));
        out.cancel(Timer::ResolveDeadline(fullname.to_string()));
        for waiter in pending.waiters {
            let _ = waiter.send(Ok(current.service.clone()));
        }
        for browse in pending.sessions {
            let resolver = self.resolver(browse, &pending.key);
            let Some(session) = self.sessions.get_mut(&browse) else {
                continue;
            };
            if let Some(known) = session.known.get_mut(fullname) {
                if known.last_resolved.as_ref() != Some(&current.service) {
                    known.last_resolved = Some(current.service.clone());
                    let _ = session.events.send(DiscoveryEvent::Resolved {
                        service: current.service.clone(),
                        resolver,
                    });
                }
            }
        }
    }

    /// Instances whose SRV record points at `host`.
    fn instances_on_host(&self, cache: &RecordCache, host: &str) -> Vec<String> {
        let candidates: BTreeSet<&String> = self
            .sessions
            .values()
            .flat_map(|s| s.known.keys())
            .chain(self.resolves.keys())
            .collect();
        candidates
            .into_iter()
            .filter(|fullname| srv_target(cache, fullname).as_deref() == Some(host))
            .cloned()
            .collect()
    }

    /// Re-queries watched records that reached a refresh point.
    pub fn refresh(&self, cache: &mut RecordCache, now: Instant, out: &mut Outbox) {
        let mut watched: HashSet<String> = self.queries.keys().cloned().collect();
        for fullname in self
            .sessions
            .values()
            .flat_map(|s| s.known.keys())
            .chain(self.resolves.keys())
        {
            if let Some(host) = srv_target(cache, fullname) {
                watched.insert(host);
            }
            watched.insert(fullname.clone());
        }
        let due = cache.refresh_due(now, |key| watched.contains(&key.name));
        if due.is_empty() {
            return;
        }
        let mut query = Message::query();
        for (name, rtype) in due {
            query.questions.push(Question::new(name, rtype));
        }
        tracing::debug!("Refreshing {} cached record set(s)", query.questions.len());
        out.multicast(query);
    }

    /// Ends every session with `TransportLost` and drops all queries. Pending
    /// resolves fail.
    pub fn transport_lost(&mut self, out: &mut Outbox) {
        for (_, session) in std::mem::take(&mut self.sessions) {
            let _ = session.events.send(DiscoveryEvent::TransportLost);
        }
        for (ty_domain, _) in self.queries.drain() {
            out.cancel(Timer::Query(ty_domain));
        }
        for (fullname, pending) in self.resolves.drain() {
            out.cancel(Timer::ResolveRetry(fullname.clone()));
            out.cancel(Timer::ResolveDeadline(fullname));
            for waiter in pending.waiters {
                let _ = waiter.send(Err(Error::transport_lost()));
            }
        }
    }

    /// Closes every stream and fails pending resolves.
    pub fn shutdown(&mut self) {
        self.sessions.clear();
        self.queries.clear();
        for (_, pending) in self.resolves.drain() {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(Error::EngineClosed));
            }
        }
    }

    fn resolver(&self, browse: BrowseId, key: &str) -> Resolver {
        Resolver::new(browse, key.to_string(), self.commands.clone())
    }
}
