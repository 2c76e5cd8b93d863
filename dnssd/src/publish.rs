use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, watch};

use crate::config::EngineConfig;
use crate::dns::name::{canonical, instance_fullname};
use crate::dns::{Message, Question, RData, RecordType, ResourceRecord, TxtPair};
use crate::error::{Error, Result};
use crate::schedule::{Outbox, SessionId, Timer};
use crate::service::ServiceDescriptor;
use crate::transport::Destination;

/// Host name (SRV target) and addresses of this engine.
#[derive(Debug, Clone, Default)]
pub(crate) struct HostInfo {
    pub name: String,
    pub addresses: Vec<IpAddr>,
}

/// How long the lesser of two simultaneous claims waits before starting
/// over (RFC 6762 section 8.2).
const TIEBREAK_DEFER: Duration = Duration::from_secs(1);

/// Lifecycle of a published service: `Idle -> Probing -> Announced
/// (-> Updating) -> Goodbye -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishState {
    Idle,
    Probing,
    Announced,
    /// Announced, with a change waiting for the coalescing window to close.
    Updating,
    Goodbye,
}

impl PublishState {
    pub fn is_registered(self) -> bool {
        matches!(self, Self::Announced | Self::Updating)
    }
}

/// What a [`PublishHandle`](crate::PublishHandle) watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishStatus {
    /// Instance name currently claimed, including any rename suffix.
    pub name: String,
    pub state: PublishState,
}

/// Snapshot of a published service.
#[derive(Debug, Clone, Serialize)]
pub struct PublishedService {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub port: u16,
    pub txt: BTreeMap<String, Option<Vec<u8>>>,
    pub state: PublishState,
}

struct PublishSession {
    descriptor: ServiceDescriptor,
    name: String,
    state: PublishState,
    probes_sent: u8,
    renames: u32,
    announces_left: u8,
    register_timeout: Duration,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    status: watch::Sender<PublishStatus>,
    /// Records last put on the wire, for goodbyes and for recognising our
    /// own packets.
    announced: Vec<ResourceRecord>,
}

impl PublishSession {
    fn fullname(&self) -> String {
        instance_fullname(&self.name, &self.descriptor.ty_domain())
    }

    fn set_state(&mut self, state: PublishState) {
        self.state = state;
        self.status.send_replace(PublishStatus {
            name: self.name.clone(),
            state,
        });
    }

    fn complete(&mut self, result: impl Fn() -> Result<()>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result());
        }
    }
}

/// Records owned by one service.
struct ServiceRecords {
    ptr: ResourceRecord,
    srv: ResourceRecord,
    txt: ResourceRecord,
    addresses: Vec<ResourceRecord>,
}

impl ServiceRecords {
    fn build(config: &EngineConfig, host: &HostInfo, session: &PublishSession) -> Self {
        let fullname = session.fullname();
        let descriptor = &session.descriptor;
        let ttl = config.record_ttl_secs;
        let addresses = if descriptor.addresses().is_empty() {
            host.addresses.as_slice()
        } else {
            descriptor.addresses()
        };
        Self {
            ptr: ResourceRecord::new(
                descriptor.ty_domain(),
                config.ptr_ttl_secs,
                RData::Ptr(fullname.clone()),
            ),
            srv: ResourceRecord::new(
                fullname.clone(),
                ttl,
                RData::Srv {
                    priority: descriptor.priority(),
                    weight: descriptor.weight(),
                    port: descriptor.port(),
                    target: host.name.clone(),
                },
            )
            .with_cache_flush(true),
            txt: ResourceRecord::new(fullname, ttl, RData::Txt(descriptor.txt().to_vec()))
                .with_cache_flush(true),
            addresses: addresses
                .iter()
                .map(|ip| {
                    ResourceRecord::new(host.name.clone(), ttl, RData::address(*ip)).with_cache_flush(true)
                })
                .collect(),
        }
    }

    /// Authority section of a probing query: the unique records being
    /// claimed, without the cache-flush bit.
    fn claim(&self) -> Vec<ResourceRecord> {
        vec![self.srv.with_cache_flush(false), self.txt.with_cache_flush(false)]
    }

    fn all(&self) -> Vec<ResourceRecord> {
        let mut all = vec![self.ptr.clone(), self.srv.clone(), self.txt.clone()];
        all.extend(self.addresses.iter().cloned());
        all
    }

    /// Extra records a querier will want along with `answer`.
    fn additionals_for(&self, answer: &ResourceRecord) -> Vec<ResourceRecord> {
        match answer.rtype() {
            RecordType::Ptr => {
                let mut extra = vec![self.srv.clone(), self.txt.clone()];
                extra.extend(self.addresses.iter().cloned());
                extra
            }
            RecordType::Srv => self.addresses.clone(),
            _ => Vec::new(),
        }
    }
}

fn announcement(records: Vec<ResourceRecord>) -> Message {
    let mut message = Message::response();
    message.answers = records;
    message
}

fn push_unique(records: &mut Vec<ResourceRecord>, record: ResourceRecord) {
    if !records.iter().any(|r| r.same_data(&record)) {
        records.push(record);
    }
}

/// Orders two claims on one name. Each side's records are sorted by class,
/// type and raw rdata, then compared pairwise; a side that runs out first is
/// the lesser.
fn compare_claims<'a>(
    ours: impl IntoIterator<Item = &'a ResourceRecord>,
    theirs: impl IntoIterator<Item = &'a ResourceRecord>,
) -> Ordering {
    let sorted = |records: Vec<&ResourceRecord>| {
        let mut keys: Vec<(u16, u16, Vec<u8>)> = records
            .into_iter()
            .map(|r| (r.class(), r.rtype().code(), r.rdata_bytes().unwrap_or_default()))
            .collect();
        keys.sort();
        keys
    };
    sorted(ours.into_iter().collect()).cmp(&sorted(theirs.into_iter().collect()))
}

/// The querier already holds `answer` with at least half its TTL left.
fn suppressed(query: &Message, answer: &ResourceRecord) -> bool {
    query
        .answers
        .iter()
        .any(|known| known.same_data(answer) && known.ttl() >= answer.ttl() / 2)
}

pub(crate) struct Publisher {
    config: Arc<EngineConfig>,
    host: HostInfo,
    sessions: BTreeMap<SessionId, PublishSession>,
    next_id: SessionId,
}

impl Publisher {
    pub fn new(config: Arc<EngineConfig>, host: HostInfo) -> Self {
        Self {
            config,
            host,
            sessions: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    pub fn set_host(&mut self, host: HostInfo) {
        self.host = host;
    }

    pub fn create(&mut self, descriptor: ServiceDescriptor) -> (SessionId, watch::Receiver<PublishStatus>) {
        let id = self.next_id;
        self.next_id += 1;
        let name = descriptor.instance_name().to_string();
        let (status, rx) = watch::channel(PublishStatus {
            name: name.clone(),
            state: PublishState::Idle,
        });
        self.sessions.insert(
            id,
            PublishSession {
                descriptor,
                name,
                state: PublishState::Idle,
                probes_sent: 0,
                renames: 0,
                announces_left: 0,
                register_timeout: Duration::ZERO,
                waiters: Vec::new(),
                status,
                announced: Vec::new(),
            },
        );
        (id, rx)
    }

    #[cfg(test)]
    pub fn state(&self, id: SessionId) -> Option<PublishState> {
        self.sessions.get(&id).map(|s| s.state)
    }

    pub fn published(&self) -> Vec<PublishedService> {
        self.sessions
            .values()
            .map(|s| PublishedService {
                name: s.name.clone(),
                service_type: s.descriptor.ty_domain(),
                port: s.descriptor.port(),
                txt: RData::txt_map(s.descriptor.txt()),
                state: s.state,
            })
            .collect()
    }

    pub fn register(
        &mut self,
        id: SessionId,
        timeout: Duration,
        reply: oneshot::Sender<Result<()>>,
        out: &mut Outbox,
    ) {
        let Some(session) = self.sessions.get_mut(&id) else {
            let _ = reply.send(Err(Error::Cancelled));
            return;
        };
        match session.state {
            PublishState::Announced | PublishState::Updating => {
                let _ = reply.send(Ok(()));
            }
            PublishState::Probing => session.waiters.push(reply),
            PublishState::Idle | PublishState::Goodbye => {
                session.waiters.push(reply);
                session.register_timeout = timeout;
                session.renames = 0;
                session.name = session.descriptor.instance_name().to_string();
                out.schedule(Timer::RegisterDeadline(id), timeout);
                self.start_probing(id, out);
            }
        }
    }

    pub fn unregister(&mut self, id: SessionId, reply: oneshot::Sender<Result<()>>, out: &mut Outbox) {
        self.withdraw(id, out);
        let _ = reply.send(Ok(()));
    }

    /// Unregisters and forgets the session; its handle is gone.
    pub fn release(&mut self, id: SessionId, out: &mut Outbox) {
        self.withdraw(id, out);
        self.sessions.remove(&id);
    }

    pub fn update(
        &mut self,
        id: SessionId,
        txt: Option<Vec<TxtPair>>,
        addresses: Option<Vec<IpAddr>>,
        out: &mut Outbox,
    ) -> Result<()> {
        let session = self.sessions.get_mut(&id).ok_or(Error::Cancelled)?;
        if let Some(txt) = txt {
            session.descriptor.set_txt(txt);
        }
        if let Some(addresses) = addresses {
            session.descriptor.set_addresses(addresses);
        }
        if session.state == PublishState::Announced {
            session.set_state(PublishState::Updating);
            out.schedule(Timer::Coalesce(id), self.config.update_coalesce());
        }
        Ok(())
    }

    pub fn on_probe_timer(&mut self, id: SessionId, out: &mut Outbox) {
        let Self {
            config,
            host,
            sessions,
            ..
        } = self;
        let Some(session) = sessions.get_mut(&id) else {
            return;
        };
        if session.state != PublishState::Probing {
            return;
        }
        let records = ServiceRecords::build(config, host, session);
        if session.probes_sent < config.probe_count {
            let mut probe = Message::query();
            probe
                .questions
                .push(Question::unicast(session.fullname(), RecordType::Any));
            probe.authorities = records.claim();
            out.multicast(probe);
            session.probes_sent += 1;
            out.schedule(Timer::Probe(id), config.probe_interval());
            return;
        }

        session.set_state(PublishState::Announced);
        let all = records.all();
        out.multicast(announcement(all.clone()));
        session.announced = all;
        session.announces_left = config.announce_count.saturating_sub(1);
        if session.announces_left > 0 {
            out.schedule(Timer::Announce(id), config.announce_interval());
        }
        out.schedule(Timer::Reannounce(id), config.reannounce_interval());
        out.cancel(Timer::RegisterDeadline(id));
        session.complete(|| Ok(()));
        tracing::info!("Announced {}", session.fullname());
    }

    pub fn on_announce_timer(&mut self, id: SessionId, out: &mut Outbox) {
        let Self {
            config,
            host,
            sessions,
            ..
        } = self;
        let Some(session) = sessions.get_mut(&id) else {
            return;
        };
        if !session.state.is_registered() || session.announces_left == 0 {
            return;
        }
        let all = ServiceRecords::build(config, host, session).all();
        out.multicast(announcement(all.clone()));
        session.announced = all;
        session.announces_left -= 1;
        if session.announces_left > 0 {
            out.schedule(Timer::Announce(id), config.announce_interval());
        }
    }

    pub fn on_reannounce_timer(&mut self, id: SessionId, out: &mut Outbox) {
        let Self {
            config,
            host,
            sessions,
            ..
        } = self;
        let Some(session) = sessions.get_mut(&id) else {
            return;
        };
        if !session.state.is_registered() {
            return;
        }
        let all = ServiceRecords::build(config, host, session).all();
        out.multicast(announcement(all.clone()));
        session.announced = all;
        out.schedule(Timer::Reannounce(id), config.reannounce_interval());
    }

    /// Ends the coalescing window: one announcement carrying the new records,
    /// plus goodbyes for records the change dropped.
    pub fn on_coalesce_timer(&mut self, id: SessionId, out: &mut Outbox) {
        let Self {
            config,
            host,
            sessions,
            ..
        } = self;
        let Some(session) = sessions.get_mut(&id) else {
            return;
        };
        if session.state != PublishState::Updating {
            return;
        }
        let all = ServiceRecords::build(config, host, session).all();
        let keys: HashSet<_> = all.iter().map(|r| r.key()).collect();
        let mut answers = all.clone();
        answers.extend(
            session
                .announced
                .iter()
                .filter(|r| !keys.contains(&r.key()))
                .map(|r| r.with_ttl(0)),
        );
        out.multicast(announcement(answers));
        session.announced = all;
        session.set_state(PublishState::Announced);
        tracing::debug!("Re-announced updated {}", session.fullname());
    }

    pub fn on_register_deadline(&mut self, id: SessionId, out: &mut Outbox) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if session.state != PublishState::Probing {
            return;
        }
        Self::stop(session, id, out);
        let name = session.name.clone();
        let timeout = session.register_timeout;
        tracing::warn!("Registration of {:?} timed out after {:?}", name, timeout);
        session.complete(|| {
            Err(Error::RegisterTimeout {
                name: name.clone(),
                timeout,
            })
        });
    }

    /// Another host is probing for a name we are probing for too. The lesser
    /// claim yields: it waits a second and starts over with the same name,
    /// and by then the other host answers for it. Our own query looped back
    /// compares equal and changes nothing.
    pub fn on_query(&mut self, query: &Message, out: &mut Outbox) {
        if query.is_response() || query.authorities.is_empty() {
            return;
        }
        let Self {
            config,
            host,
            sessions,
            ..
        } = self;
        for (id, session) in sessions.iter_mut() {
            if session.state != PublishState::Probing {
                continue;
            }
            let fullname = canonical(&session.fullname());
            let theirs: Vec<&ResourceRecord> = query
                .authorities
                .iter()
                .filter(|r| canonical(r.name()) == fullname)
                .collect();
            if theirs.is_empty() {
                continue;
            }
            let ours = ServiceRecords::build(config, host, session).claim();
            if compare_claims(&ours, theirs) == Ordering::Less {
                tracing::info!(
                    "Lost simultaneous claim on {}, retrying in {:?}",
                    session.fullname(),
                    TIEBREAK_DEFER
                );
                session.probes_sent = 0;
                out.schedule(Timer::Probe(*id), TIEBREAK_DEFER);
            }
        }
    }

    /// Checks a response for records that claim one of our names with
    /// different data. A session still probing moves to the next name. An
    /// announced session keeps its name and starts probing for it again; it
    /// only renames if that round is answered by the other host.
    pub fn on_response(&mut self, message: &Message, out: &mut Outbox) {
        let conflicts: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| matches!(s.state, PublishState::Probing) || s.state.is_registered())
            .filter(|(_, s)| {
                let records = ServiceRecords::build(&self.config, &self.host, s);
                let fullname = canonical(&s.fullname());
                message.records().any(|r| {
                    !r.is_goodbye()
                        && matches!(r.rtype(), RecordType::Srv | RecordType::Txt)
                        && canonical(r.name()) == fullname
                        && !records.srv.same_data(r)
                        && !records.txt.same_data(r)
                        && !s.announced.iter().any(|ours| ours.same_data(r))
                })
            })
            .map(|(id, _)| *id)
            .collect();

        for id in conflicts {
            let Some(session) = self.sessions.get_mut(&id) else {
                continue;
            };
            tracing::info!("Conflict on {} ({:?})", session.fullname(), session.state);
            for timer in [Timer::Announce(id), Timer::Reannounce(id), Timer::Coalesce(id), Timer::Probe(id)] {
                out.cancel(timer);
            }
            if session.state.is_registered() {
                session.probes_sent = 0;
                session.set_state(PublishState::Probing);
                self.on_probe_timer(id, out);
                continue;
            }
            // The name belongs to the peer now; a goodbye would also
            // evict its records from other caches.
            session.announced.clear();
            if self.rename(id, out) {
                self.start_probing(id, out);
            }
        }
    }

    /// Answers the questions of `query` from announced services.
    pub fn respond(&self, query: &Message, from: SocketAddr, out: &mut Outbox) {
        if query.is_response() || query.questions.is_empty() {
            return;
        }
        let registered: Vec<ServiceRecords> = self
            .sessions
            .values()
            .filter(|s| s.state.is_registered())
            .map(|s| ServiceRecords::build(&self.config, &self.host, s))
            .collect();
        if registered.is_empty() {
            return;
        }

        // Legacy resolvers query from an ephemeral port and expect a plain
        // unicast DNS reply.
        let legacy = from.port() != self.config.port;
        let enumeration = canonical(&format!("_services._dns-sd._udp.{}", self.config.domain));
        let mut multicast = (Vec::new(), Vec::new());
        let mut unicast = (Vec::new(), Vec::new());

        for question in &query.questions {
            let (answers, additionals) = if legacy || question.unicast_response {
                &mut unicast
            } else {
                &mut multicast
            };
            let qname = canonical(&question.name);

            if qname == enumeration && question.qtype.matches(RecordType::Ptr) {
                for records in &registered {
                    let answer = ResourceRecord::new(
                        enumeration.clone(),
                        self.config.ptr_ttl_secs,
                        RData::Ptr(records.ptr.name().to_string()),
                    );
                    if !suppressed(query, &answer) {
                        push_unique(answers, answer);
                    }
                }
                continue;
            }

            for records in &registered {
                for record in records.all() {
                    if canonical(record.name()) != qname || !question.qtype.matches(record.rtype()) {
                        continue;
                    }
                    if suppressed(query, &record) {
                        continue;
                    }
                    for extra in records.additionals_for(&record) {
                        push_unique(additionals, extra);
                    }
                    push_unique(answers, record);
                }
            }
        }

        for (answers, additionals, destination) in [
            (multicast.0, multicast.1, Destination::Multicast),
            (unicast.0, unicast.1, Destination::Unicast(from)),
        ] {
            if answers.is_empty() {
                continue;
            }
            let mut response = Message::response();
            if legacy {
                response.id = query.id;
                response.questions = query.questions.clone();
            }
            response.additionals = additionals
                .into_iter()
                .filter(|extra| !answers.iter().any(|a| a.same_data(extra)))
                .collect();
            response.answers = answers;
            out.send(response, destination);
        }
    }

    /// Every session drops back to idle; pending registrations fail.
    pub fn transport_lost(&mut self, out: &mut Outbox) {
        for (id, session) in self.sessions.iter_mut() {
            if session.state == PublishState::Idle {
                continue;
            }
            Self::stop(session, *id, out);
            session.announced.clear();
            session.complete(|| Err(Error::transport_lost()));
        }
    }

    /// Goodbyes for everything announced; pending registrations are cancelled.
    pub fn shutdown(&mut self, out: &mut Outbox) {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.withdraw(id, out);
        }
    }

    fn withdraw(&mut self, id: SessionId, out: &mut Outbox) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        match session.state {
            PublishState::Idle => {}
            PublishState::Probing => {
                Self::stop(session, id, out);
                session.complete(|| Err(Error::Cancelled));
                tracing::debug!("Abandoned probing for {}", session.fullname());
            }
            PublishState::Announced | PublishState::Updating | PublishState::Goodbye => {
                session.set_state(PublishState::Goodbye);
                let goodbyes: Vec<ResourceRecord> =
                    session.announced.drain(..).map(|r| r.with_ttl(0)).collect();
                out.multicast(announcement(goodbyes));
                Self::stop(session, id, out);
                tracing::info!("Sent goodbye for {}", session.fullname());
            }
        }
    }

    fn start_probing(&mut self, id: SessionId, out: &mut Outbox) {
        while self.name_taken(id) {
            if !self.rename(id, out) {
                return;
            }
        }
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.probes_sent = 0;
        session.set_state(PublishState::Probing);
        tracing::debug!("Probing for {}", session.fullname());
        self.on_probe_timer(id, out);
    }

    /// Another local session already claims the same name.
    fn name_taken(&self, id: SessionId) -> bool {
        let Some(session) = self.sessions.get(&id) else {
            return false;
        };
        let fullname = canonical(&session.fullname());
        self.sessions.iter().any(|(other_id, other)| {
            *other_id != id && other.state != PublishState::Idle && canonical(&other.fullname()) == fullname
        })
    }

    /// Moves to the next candidate name. Returns false, failing the waiters,
    /// once the rename budget is spent.
    fn rename(&mut self, id: SessionId, out: &mut Outbox) -> bool {
        let max = self.config.max_rename_attempts;
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        session.renames += 1;
        if session.renames > max {
            Self::stop(session, id, out);
            let name = session.descriptor.instance_name().to_string();
            tracing::warn!("Giving up on {:?} after {} renames", name, max);
            session.complete(|| {
                Err(Error::NameConflictExhausted {
                    name: name.clone(),
                    attempts: max,
                })
            });
            return false;
        }
        session.name = format!("{} ({})", session.descriptor.instance_name(), session.renames + 1);
        tracing::info!("Renamed to {:?}", session.name);
        true
    }

    fn stop(session: &mut PublishSession, id: SessionId, out: &mut Outbox) {
        for timer in [
            Timer::Probe(id),
            Timer::Announce(id),
            Timer::Reannounce(id),
            Timer::Coalesce(id),
            Timer::RegisterDeadline(id),
        ] {
            out.cancel(timer);
        }
        session.set_state(PublishState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn publisher() -> Publisher {
        let host = HostInfo {
            name: "office.local.".to_string(),
            addresses: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))],
        };
        Publisher::new(Arc::new(EngineConfig::default()), host)
    }

    fn printer() -> ServiceDescriptor {
        ServiceDescriptor::builder("_ipp._tcp", "printer")
            .port(631)
            .build()
            .unwrap()
    }

    fn peer() -> SocketAddr {
        "10.0.0.9:5353".parse().unwrap()
    }

    /// Drives a fresh session through its three probes to Announced.
    fn announced(publisher: &mut Publisher) -> (SessionId, watch::Receiver<PublishStatus>) {
        let (id, status) = publisher.create(printer());
        let (tx, _rx) = oneshot::channel();
        let mut out = Outbox::default();
        publisher.register(id, Duration::from_secs(10), tx, &mut out);
        for _ in 0..3 {
            publisher.on_probe_timer(id, &mut out);
        }
        assert_eq!(publisher.state(id), Some(PublishState::Announced));
        (id, status)
    }

    #[test]
    fn test_probes_then_announces() {
        let mut publisher = publisher();
        let (id, _) = publisher.create(printer());
        let (tx, mut rx) = oneshot::channel();
        let mut out = Outbox::default();
        publisher.register(id, Duration::from_secs(10), tx, &mut out);

        assert_eq!(publisher.state(id), Some(PublishState::Probing));
        let probe = out.sent()[0];
        assert!(probe.questions[0].unicast_response);
        assert_eq!(probe.questions[0].qtype, RecordType::Any);
        assert_eq!(probe.authorities.len(), 2);
        assert_eq!(out.scheduled(&Timer::Probe(id)), Some(Duration::from_millis(250)));

        publisher.on_probe_timer(id, &mut out);
        publisher.on_probe_timer(id, &mut out);
        assert_eq!(publisher.state(id), Some(PublishState::Probing));
        publisher.on_probe_timer(id, &mut out);
        assert_eq!(publisher.state(id), Some(PublishState::Announced));

        let announcement = out.sent()[3];
        assert!(announcement.is_response());
        assert!(announcement
            .answers
            .iter()
            .any(|r| r.rtype() == RecordType::Ptr && r.ttl() == 225 && !r.cache_flush()));
        assert!(announcement
            .answers
            .iter()
            .filter(|r| r.rtype() != RecordType::Ptr)
            .all(|r| r.ttl() == 120 && r.cache_flush()));
        assert_eq!(out.scheduled(&Timer::Reannounce(id)), Some(Duration::from_secs(60)));
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn test_register_when_announced_sends_nothing() {
        let mut publisher = publisher();
        let (id, _) = announced(&mut publisher);
        let (tx, mut rx) = oneshot::channel();
        let mut out = Outbox::default();
        publisher.register(id, Duration::from_secs(10), tx, &mut out);
        assert!(out.sent().is_empty());
        assert!(out.drain().next().is_none());
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn test_unregister_idle_is_noop() {
        let mut publisher = publisher();
        let (id, _) = publisher.create(printer());
        let (tx, mut rx) = oneshot::channel();
        let mut out = Outbox::default();
        publisher.unregister(id, tx, &mut out);
        assert!(out.sent().is_empty());
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn test_goodbye_uses_ttl_zero() {
        let mut publisher = publisher();
        let (id, _) = announced(&mut publisher);
        let (tx, _rx) = oneshot::channel();
        let mut out = Outbox::default();
        publisher.unregister(id, tx, &mut out);
        let goodbye = out.sent()[0];
        assert!(!goodbye.answers.is_empty());
        assert!(goodbye.answers.iter().all(|r| r.ttl() == 0));
        assert_eq!(publisher.state(id), Some(PublishState::Idle));
    }

    #[test]
    fn test_local_duplicate_is_renamed() {
        let mut publisher = publisher();
        announced(&mut publisher);
        let (second, status) = publisher.create(printer());
        let (tx, _rx) = oneshot::channel();
        publisher.register(second, Duration::from_secs(10), tx, &mut Outbox::default());
        assert_eq!(status.borrow().name, "printer (2)");
        assert_eq!(status.borrow().state, PublishState::Probing);
    }

    #[test]
    fn test_conflicting_answer_renames_while_probing() {
        let mut publisher = publisher();
        let (id, status) = publisher.create(printer());
        let (tx, _rx) = oneshot::channel();
        let mut out = Outbox::default();
        publisher.register(id, Duration::from_secs(10), tx, &mut out);

        let mut response = Message::response();
        response.answers.push(ResourceRecord::new(
            "printer._ipp._tcp.local.",
            120,
            RData::Srv {
                priority: 0,
                weight: 0,
                port: 631,
                target: "elsewhere.local.".to_string(),
            },
        ));
        publisher.on_response(&response, &mut out);
        assert_eq!(status.borrow().name, "printer (2)");
        assert_eq!(publisher.state(id), Some(PublishState::Probing));
    }

    #[test]
    fn test_own_echo_is_not_a_conflict() {
        let mut publisher = publisher();
        let (id, _) = announced(&mut publisher);
        let mut out = Outbox::default();
        publisher.on_reannounce_timer(id, &mut out);
        let echo = out.sent()[0].clone();
        publisher.on_response(&echo, &mut out);
        assert_eq!(publisher.state(id), Some(PublishState::Announced));
    }

    #[test]
    fn test_rename_budget_exhausted() {
        let mut publisher = Publisher::new(
            Arc::new(EngineConfig {
                max_rename_attempts: 1,
                ..EngineConfig::default()
            }),
            HostInfo::default(),
        );
        let (id, _) = publisher.create(printer());
        let (tx, mut rx) = oneshot::channel();
        let mut out = Outbox::default();
        publisher.register(id, Duration::from_secs(10), tx, &mut out);
        for name in ["printer._ipp._tcp.local.", "printer (2)._ipp._tcp.local."] {
            let mut response = Message::response();
            response
                .answers
                .push(ResourceRecord::new(name, 120, RData::Txt(vec![("x".to_string(), None)])));
            publisher.on_response(&response, &mut out);
        }
        assert_eq!(publisher.state(id), Some(PublishState::Idle));
        assert!(matches!(
            rx.try_recv(),
            Ok(Err(Error::NameConflictExhausted { attempts: 1, .. }))
        ));
    }

    #[test]
    fn test_register_deadline_resets_to_idle() {
        let mut publisher = publisher();
        let (id, _) = publisher.create(printer());
        let (tx, mut rx) = oneshot::channel();
        let mut out = Outbox::default();
        publisher.register(id, Duration::from_millis(100), tx, &mut out);
        publisher.on_register_deadline(id, &mut out);
        assert_eq!(publisher.state(id), Some(PublishState::Idle));
        assert!(matches!(rx.try_recv(), Ok(Err(Error::RegisterTimeout { .. }))));
    }

    #[test]
    fn test_updates_coalesce_into_one_announcement() {
        let mut publisher = publisher();
        let (id, _) = announced(&mut publisher);
        let mut out = Outbox::default();
        publisher
            .update(id, Some(vec![("rp".to_string(), Some(b"a".to_vec()))]), None, &mut out)
            .unwrap();
        publisher
            .update(id, Some(vec![("rp".to_string(), Some(b"b".to_vec()))]), None, &mut out)
            .unwrap();
        assert_eq!(publisher.state(id), Some(PublishState::Updating));
        assert!(out.sent().is_empty());

        publisher.on_coalesce_timer(id, &mut out);
        let sent = out.sent();
        assert_eq!(sent.len(), 1);
        let txt = sent[0]
            .answers
            .iter()
            .find(|r| r.rtype() == RecordType::Txt)
            .unwrap();
        assert_eq!(txt.rdata(), &RData::Txt(vec![("rp".to_string(), Some(b"b".to_vec()))]));
        assert_eq!(publisher.state(id), Some(PublishState::Announced));
    }

    #[test]
    fn test_respond_with_additionals() {
        let mut publisher = publisher();
        announced(&mut publisher);
        let mut query = Message::query();
        query.questions.push(Question::new("_ipp._tcp.local.", RecordType::Ptr));
        let mut out = Outbox::default();
        publisher.respond(&query, peer(), &mut out);

        let response = out.sent()[0];
        assert_eq!(response.answers.len(), 1);
        let kinds: Vec<RecordType> = response.additionals.iter().map(|r| r.rtype()).collect();
        assert_eq!(kinds, vec![RecordType::Srv, RecordType::Txt, RecordType::A]);
    }

    #[test]
    fn test_known_answer_suppresses_reply() {
        let mut publisher = publisher();
        announced(&mut publisher);
        let mut query = Message::query();
        query.questions.push(Question::new("_ipp._tcp.local.", RecordType::Ptr));
        query.answers.push(ResourceRecord::new(
            "_ipp._tcp.local.",
            200,
            RData::Ptr("printer._ipp._tcp.local.".to_string()),
        ));
        let mut out = Outbox::default();
        publisher.respond(&query, peer(), &mut out);
        assert!(out.sent().is_empty());
    }

    #[test]
    fn test_enumeration_and_unicast_reply() {
        let mut publisher = publisher();
        announced(&mut publisher);
        let mut query = Message::query();
        query
            .questions
            .push(Question::unicast("_services._dns-sd._udp.local.", RecordType::Ptr));
        let mut out = Outbox::default();
        publisher.respond(&query, peer(), &mut out);

        let effects: Vec<_> = out.drain().collect();
        assert_eq!(effects.len(), 1);
        let crate::schedule::Effect::Send(response, Destination::Unicast(to)) = &effects[0] else {
            panic!("expected a unicast reply, got {effects:?}");
        };
        assert_eq!(*to, peer());
        assert_eq!(
            response.answers[0].rdata(),
            &RData::Ptr("_ipp._tcp.local.".to_string())
        );
    }

    /// A probing query from another host claiming `printer` with a different
    /// SRV target.
    fn rival_query(target: &str) -> Message {
        let mut query = Message::query();
        query
            .questions
            .push(Question::unicast("printer._ipp._tcp.local.", RecordType::Any));
        query.authorities = vec![
            ResourceRecord::new(
                "printer._ipp._tcp.local.",
                120,
                RData::Srv {
                    priority: 0,
                    weight: 1,
                    port: 631,
                    target: target.to_string(),
                },
            ),
            ResourceRecord::new("printer._ipp._tcp.local.", 120, RData::Txt(Vec::new())),
        ];
        query
    }

    #[test]
    fn test_lesser_simultaneous_claim_defers() {
        let mut publisher = publisher();
        let (id, status) = publisher.create(printer());
        let (tx, _rx) = oneshot::channel();
        let mut out = Outbox::default();
        publisher.register(id, Duration::from_secs(10), tx, &mut out);
        publisher.on_probe_timer(id, &mut out);

        // Labels compare length byte first: "office" is shorter than
        // "printserver", so our claim is the lesser one.
        let mut out = Outbox::default();
        publisher.on_query(&rival_query("printserver.local."), &mut out);
        assert_eq!(out.scheduled(&Timer::Probe(id)), Some(TIEBREAK_DEFER));
        assert_eq!(status.borrow().name, "printer");
        assert_eq!(publisher.state(id), Some(PublishState::Probing));

        // The deferred round starts from the first query again.
        for _ in 0..3 {
            publisher.on_probe_timer(id, &mut out);
        }
        assert_eq!(publisher.state(id), Some(PublishState::Probing));
        publisher.on_probe_timer(id, &mut out);
        assert_eq!(publisher.state(id), Some(PublishState::Announced));
    }

    #[test]
    fn test_greater_simultaneous_claim_carries_on() {
        let mut publisher = publisher();
        let (id, _) = publisher.create(printer());
        let (tx, _rx) = oneshot::channel();
        publisher.register(id, Duration::from_secs(10), tx, &mut Outbox::default());

        let mut out = Outbox::default();
        publisher.on_query(&rival_query("alpha.local."), &mut out);
        assert!(out.drain().next().is_none());
    }

    #[test]
    fn test_own_query_echo_is_not_a_claim() {
        let mut publisher = publisher();
        let (id, _) = publisher.create(printer());
        let (tx, _rx) = oneshot::channel();
        let mut out = Outbox::default();
        publisher.register(id, Duration::from_secs(10), tx, &mut out);
        let echo = out.sent()[0].clone();

        let mut out = Outbox::default();
        publisher.on_query(&echo, &mut out);
        assert!(out.drain().next().is_none());
    }

    #[test]
    fn test_announced_name_is_answered_not_yielded() {
        let mut publisher = publisher();
        let (id, status) = announced(&mut publisher);
        let rival = rival_query("alpha.local.");

        let mut out = Outbox::default();
        publisher.on_query(&rival, &mut out);
        publisher.respond(&rival, peer(), &mut out);
        let reply = out.sent()[0];
        assert!(reply.is_response());
        assert!(reply
            .answers
            .iter()
            .any(|r| r.rdata() == &RData::Srv {
                priority: 0,
                weight: 1,
                port: 631,
                target: "office.local.".to_string(),
            }));
        assert_eq!(status.borrow().name, "printer");
        assert_eq!(publisher.state(id), Some(PublishState::Announced));
    }

    #[test]
    fn test_conflict_while_announced_reclaims_before_renaming() {
        let mut publisher = publisher();
        let (id, status) = announced(&mut publisher);
        let mut response = Message::response();
        response.answers.push(ResourceRecord::new(
            "printer._ipp._tcp.local.",
            120,
            RData::Srv {
                priority: 0,
                weight: 0,
                port: 631,
                target: "elsewhere.local.".to_string(),
            },
        ));

        let mut out = Outbox::default();
        publisher.on_response(&response, &mut out);
        assert_eq!(status.borrow().name, "printer");
        assert_eq!(publisher.state(id), Some(PublishState::Probing));
        assert_eq!(out.sent()[0].questions[0].name, "printer._ipp._tcp.local.");

        // The other host answers our new round, so the name is lost.
        publisher.on_response(&response, &mut out);
        assert_eq!(status.borrow().name, "printer (2)");
        assert_eq!(publisher.state(id), Some(PublishState::Probing));
    }
}
