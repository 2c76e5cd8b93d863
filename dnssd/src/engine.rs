use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shared::names::{is_valid_service_type, strip_local};
use shared::types::DiscoveredService;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::browse::{BrowseStream, DiscoveryEvent};
use crate::cache::RecordCache;
use crate::config::EngineConfig;
use crate::dns::name::{from_labels, labels};
use crate::dns::TxtPair;
use crate::error::{Error, Result};
use crate::publish::{HostInfo, PublishStatus, PublishedService, Publisher};
use crate::query::QueryEngine;
use crate::schedule::{BrowseId, Effect, Outbox, SessionId, Timer, TimerQueue};
use crate::service::{PublishHandle, ServiceDescriptor};
use crate::transport::{
    AllowAll, Family, LinkFactory, NetworkPermission, SocketFactory, TransportEvent, TransportHandle,
};

const REOPEN_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

/// Commands sent to the engine task
pub(crate) enum Command {
    Browse {
        id: BrowseId,
        ty_domain: String,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    },
    StopBrowse(BrowseId),
    Resolve {
        key: String,
        reply: oneshot::Sender<Result<DiscoveredService>>,
    },
    ResolveFor {
        browse: BrowseId,
        key: String,
    },
    CreateService {
        descriptor: ServiceDescriptor,
        reply: oneshot::Sender<(SessionId, watch::Receiver<PublishStatus>)>,
    },
    Register {
        id: SessionId,
        timeout: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
    Unregister {
        id: SessionId,
        reply: oneshot::Sender<Result<()>>,
    },
    Update {
        id: SessionId,
        txt: Option<Vec<TxtPair>>,
        addresses: Option<Vec<IpAddr>>,
        reply: oneshot::Sender<Result<()>>,
    },
    Release(SessionId),
    Published(oneshot::Sender<Vec<PublishedService>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running engine. Cheap to clone; every clone talks to the
/// same task.
#[derive(Clone)]
pub struct Engine {
    commands: mpsc::UnboundedSender<Command>,
    next_browse: Arc<AtomicU64>,
    domain: String,
}

pub struct EngineBuilder {
    config: EngineConfig,
    links: Arc<dyn LinkFactory>,
    permission: Arc<dyn NetworkPermission>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            links: Arc::new(SocketFactory),
            permission: Arc::new(AllowAll),
        }
    }
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Where links come from; UDP sockets unless replaced.
    pub fn link_factory(mut self, links: impl LinkFactory) -> Self {
        self.links = Arc::new(links);
        self
    }

    pub fn permission(mut self, permission: impl NetworkPermission) -> Self {
        self.permission = Arc::new(permission);
        self
    }

    /// Opens the transports and starts the engine task. Fails without
    /// starting anything if the permission is missing or a socket cannot
    /// be bound.
    pub async fn open(self) -> Result<Engine> {
        let config = Arc::new(self.config);
        let (events_tx, events) = flume::unbounded();

        let mut transports = Vec::new();
        for family in families(&config) {
            transports.push(TransportHandle::open(
                self.links.as_ref(),
                self.permission.as_ref(),
                family,
                &config,
                events_tx.clone(),
            )?);
        }
        if transports.is_empty() {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::InvalidInput,
                "neither ipv4 nor ipv6 is enabled",
            )));
        }

        let host = HostInfo {
            name: host_name(&config),
            addresses: host_addresses(&transports),
        };
        tracing::info!("Engine host name is {}", host.name);

        let (commands, rx) = mpsc::unbounded_channel();
        let core = EngineCore {
            queries: QueryEngine::new(config.clone(), commands.downgrade()),
            publisher: Publisher::new(config.clone(), host),
            cache: RecordCache::new(),
            timers: TimerQueue::default(),
            outbox: Outbox::default(),
            transports,
            events_tx,
            links: self.links,
            permission: self.permission,
            reopen_attempts: HashMap::new(),
            config: config.clone(),
        };
        tokio::spawn(core.run(rx, events));

        Ok(Engine {
            commands,
            next_browse: Arc::new(AtomicU64::new(1)),
            domain: config.domain.clone(),
        })
    }
}

fn families(config: &EngineConfig) -> Vec<Family> {
    let mut families = Vec::new();
    if config.ipv4 {
        families.push(Family::V4);
    }
    if config.ipv6 {
        families.push(Family::V6);
    }
    families
}

/// Configured or system host name, first label only, inside the engine domain.
fn host_name(config: &EngineConfig) -> String {
    let raw = match &config.host_name {
        Some(name) => name.clone(),
        None => hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to read system host name: {}", e);
                "dnssd".to_string()
            }),
    };
    let label = labels(&raw).into_iter().next().unwrap_or_else(|| "dnssd".to_string());
    let mut all = vec![label];
    all.extend(labels(&config.domain));
    from_labels(&all)
}

fn host_addresses(transports: &[TransportHandle]) -> Vec<IpAddr> {
    let mut addresses: Vec<IpAddr> = transports.iter().flat_map(|t| t.host_addresses()).collect();
    addresses.sort();
    addresses.dedup();
    addresses
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Opens an engine on UDP sockets.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        Self::builder().config(config).open().await
    }

    /// Starts browsing `service_type` (`_ipp._tcp`, `_ipp._tcp.` or
    /// `_ipp._tcp.local.`). Never blocks; events arrive on the stream.
    pub fn browse(&self, service_type: &str) -> Result<BrowseStream> {
        if !is_valid_service_type(service_type) {
            return Err(Error::InvalidDescriptor(format!(
                "{service_type:?} is not a DNS-SD service type"
            )));
        }
        let ty_domain = format!(
            "{}.{}",
            strip_local(service_type).trim_end_matches('.'),
            self.domain
        );
        let id = self.next_browse.fetch_add(1, Ordering::Relaxed);
        let (events, rx) = mpsc::unbounded_channel();
        self.send(Command::Browse {
            id,
            ty_domain: ty_domain.clone(),
            events,
        })?;
        Ok(BrowseStream::new(id, ty_domain, rx, self.commands.clone()))
    }

    /// Resolves a discovered service by key. Answers from the cache when
    /// SRV, TXT and address records are all present.
    pub async fn resolve(&self, key: &str) -> Result<DiscoveredService> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Resolve {
            key: key.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::EngineClosed)?
    }

    /// Creates an idle publish session; nothing is sent until
    /// [`PublishHandle::register`] is called.
    pub async fn create_service(&self, descriptor: ServiceDescriptor) -> Result<PublishHandle> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreateService {
            descriptor: descriptor.clone(),
            reply,
        })?;
        let (id, status) = rx.await.map_err(|_| Error::EngineClosed)?;
        Ok(PublishHandle::new(id, descriptor, self.commands.clone(), status))
    }

    /// Creates a session and registers it within `timeout`.
    pub async fn publish(&self, descriptor: ServiceDescriptor, timeout: Duration) -> Result<PublishHandle> {
        let handle = self.create_service(descriptor).await?;
        handle.register(timeout).await?;
        Ok(handle)
    }

    /// Sends goodbyes and frees the session.
    pub async fn unpublish(&self, handle: PublishHandle) -> Result<()> {
        handle.unregister().await
    }

    pub async fn published(&self) -> Result<Vec<PublishedService>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Published(reply))?;
        rx.await.map_err(|_| Error::EngineClosed)
    }

    /// Unpublishes everything, closes every browse stream and the sockets.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown(reply))?;
        rx.await.map_err(|_| Error::EngineClosed)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::EngineClosed)
    }
}

/// Owns the cache, publisher, query engine and timers. Runs on one task.
struct EngineCore {
    config: Arc<EngineConfig>,
    links: Arc<dyn LinkFactory>,
    permission: Arc<dyn NetworkPermission>,
    transports: Vec<TransportHandle>,
    events_tx: flume::Sender<TransportEvent>,
    cache: RecordCache,
    publisher: Publisher,
    queries: QueryEngine,
    timers: TimerQueue,
    outbox: Outbox,
    reopen_attempts: HashMap<Family, u32>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl EngineCore {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, events: flume::Receiver<TransportEvent>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = self.timers.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Ok(event) = events.recv_async() => self.handle_transport(event),
                _ = sweep.tick() => self.sweep(),
                _ = sleep_until(wake) => self.fire_timers(),
            }
            self.flush();
        }
        tracing::info!("Engine task stopped");
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        let out = &mut self.outbox;
        match command {
            Command::Browse { id, ty_domain, events } => {
                if self.transports.is_empty() {
                    let _ = events.send(DiscoveryEvent::TransportLost);
                    return;
                }
                self.queries.browse(id, &ty_domain, events, &self.cache, now, out);
            }
            Command::StopBrowse(id) => self.queries.stop_browse(id, out),
            Command::Resolve { key, reply } => {
                if self.transports.is_empty() {
                    let _ = reply.send(Err(Error::transport_lost()));
                    return;
                }
                self.queries.resolve(&key, reply, &self.cache, now, out);
            }
            Command::ResolveFor { browse, key } => {
                self.queries.resolve_for(browse, &key, &self.cache, now, out);
            }
            Command::CreateService { descriptor, reply } => {
                let _ = reply.send(self.publisher.create(descriptor));
            }
            Command::Register { id, timeout, reply } => {
                if self.transports.is_empty() {
                    let _ = reply.send(Err(Error::transport_lost()));
                    return;
                }
                self.publisher.register(id, timeout, reply, out);
            }
            Command::Unregister { id, reply } => self.publisher.unregister(id, reply, out),
            Command::Update {
                id,
                txt,
                addresses,
                reply,
            } => {
                let _ = reply.send(self.publisher.update(id, txt, addresses, out));
            }
            Command::Release(id) => self.publisher.release(id, out),
            Command::Published(reply) => {
                let _ = reply.send(self.publisher.published());
            }
            // Handled by the run loop.
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        let now = Instant::now();
        match event {
            TransportEvent::Packet { message, from, .. } => {
                if !message.is_response() {
                    self.publisher.on_query(&message, &mut self.outbox);
                    self.publisher.respond(&message, from, &mut self.outbox);
                    return;
                }
                self.publisher.on_response(&message, &mut self.outbox);
                let mut touched = Vec::new();
                for record in message.records() {
                    if self.cache.merge(record.clone()).is_visible() {
                        touched.push(record.clone());
                    }
                }
                self.queries.reconcile(&self.cache, &touched, now, &mut self.outbox);
            }
            TransportEvent::Lost { family, error } => self.on_transport_lost(family, error),
        }
    }

    /// Every session hears about the loss; the handle is reopened with
    /// backoff.
    fn on_transport_lost(&mut self, family: Family, error: io::Error) {
        tracing::error!("Lost {} transport ({}), notifying all sessions", family, error);
        self.transports.retain(|t| t.family() != family);
        self.queries.transport_lost(&mut self.outbox);
        self.publisher.transport_lost(&mut self.outbox);
        self.reopen_attempts.insert(family, 0);
        self.timers
            .schedule(Timer::Reopen(family), Instant::now() + REOPEN_INITIAL_BACKOFF);
    }

    fn reopen(&mut self, family: Family, now: Instant) {
        let opened = TransportHandle::open(
            self.links.as_ref(),
            self.permission.as_ref(),
            family,
            &self.config,
            self.events_tx.clone(),
        );
        match opened {
            Ok(handle) => {
                tracing::info!("Reopened {} transport", family);
                self.transports.push(handle);
                self.reopen_attempts.remove(&family);
                let mut host = self.publisher.host().clone();
                host.addresses = host_addresses(&self.transports);
                self.publisher.set_host(host);
            }
            Err(Error::PermissionDenied(reason)) => {
                tracing::error!("Not reopening {} transport: {}", family, reason);
                self.reopen_attempts.remove(&family);
            }
            Err(e) => {
                let attempts = self.reopen_attempts.entry(family).or_insert(0);
                *attempts += 1;
                let delay = REOPEN_INITIAL_BACKOFF
                    .saturating_mul(2u32.saturating_pow(*attempts))
                    .min(self.config.reopen_max_backoff());
                tracing::warn!("Failed to reopen {} transport: {}, retrying in {:?}", family, e, delay);
                self.timers.schedule(Timer::Reopen(family), now + delay);
            }
        }
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let expired = self.cache.expire(now);
        if !expired.is_empty() {
            tracing::debug!("Expired {} cached record(s)", expired.len());
        }
        self.queries.reconcile(&self.cache, &expired, now, &mut self.outbox);
        self.queries.refresh(&mut self.cache, now, &mut self.outbox);
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        for timer in self.timers.pop_due(now) {
            let out = &mut self.outbox;
            match timer {
                Timer::Probe(id) => self.publisher.on_probe_timer(id, out),
                Timer::Announce(id) => self.publisher.on_announce_timer(id, out),
                Timer::Reannounce(id) => self.publisher.on_reannounce_timer(id, out),
                Timer::Coalesce(id) => self.publisher.on_coalesce_timer(id, out),
                Timer::RegisterDeadline(id) => self.publisher.on_register_deadline(id, out),
                Timer::Query(ty_domain) => self.queries.on_query_timer(&ty_domain, &self.cache, now, out),
                Timer::ResolveRetry(fullname) => {
                    self.queries.on_resolve_retry(&fullname, &self.cache, now, out)
                }
                Timer::ResolveDeadline(fullname) => {
                    self.queries.on_resolve_deadline(&fullname, &self.cache, out)
                }
                Timer::Reopen(family) => self.reopen(family, now),
            }
            self.flush();
        }
    }

    /// Applies queued effects in order.
    fn flush(&mut self) {
        let now = Instant::now();
        let effects: Vec<Effect> = self.outbox.drain().collect();
        for effect in effects {
            match effect {
                Effect::Send(message, destination) => {
                    for transport in &self.transports {
                        transport.send(&message, destination);
                    }
                }
                Effect::Schedule(timer, delay) => self.timers.schedule(timer, now + delay),
                Effect::Cancel(timer) => self.timers.cancel(&timer),
            }
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("Engine shutting down");
        self.publisher.shutdown(&mut self.outbox);
        self.queries.shutdown();
        self.flush();

        // Let queued goodbyes reach the wire before the sockets go away.
        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        while Instant::now() < deadline
            && self.transports.iter().any(|t| t.is_alive() && t.in_flight() > 0)
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for transport in self.transports.drain(..) {
            transport.close();
        }
    }
}
