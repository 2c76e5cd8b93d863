pub mod memory;
mod socket;

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shared::protocol::{MAX_PACKET_SIZE, MDNS_GROUP_V4, MDNS_GROUP_V6};

use crate::config::EngineConfig;
use crate::dns::Message;
use crate::error::{Error, Result};

pub use socket::SocketFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::V4,
            SocketAddr::V6(_) => Self::V6,
        }
    }

    /// The mDNS group address of this family on `port`.
    pub fn group(self, port: u16) -> SocketAddr {
        match self {
            Self::V4 => SocketAddr::new(IpAddr::V4(MDNS_GROUP_V4), port),
            Self::V6 => SocketAddr::new(IpAddr::V6(MDNS_GROUP_V6), port),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "ipv4"),
            Self::V6 => write!(f, "ipv6"),
        }
    }
}

/// A datagram endpoint joined to the mDNS group.
pub trait Link: Send + Sync + 'static {
    fn family(&self) -> Family;

    fn local_addr(&self) -> SocketAddr;

    /// Addresses this host can be reached at through the link.
    fn host_addresses(&self) -> Vec<IpAddr>;

    /// Blocks for at most a short read timeout. Returns `WouldBlock` or
    /// `TimedOut` when nothing arrived.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Leaves the group and releases the endpoint.
    fn close(&self);
}

/// Opens links; the engine calls it again to re-open after a loss.
pub trait LinkFactory: Send + Sync + 'static {
    fn open(&self, family: Family, config: &EngineConfig) -> io::Result<Arc<dyn Link>>;
}

/// Platform gate for local network access, checked before every open.
pub trait NetworkPermission: Send + Sync + 'static {
    fn check(&self) -> std::result::Result<(), String>;
}

/// For platforms without a local network permission.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl NetworkPermission for AllowAll {
    fn check(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Multicast,
    Unicast(SocketAddr),
}

#[derive(Debug)]
pub enum TransportEvent {
    Packet {
        message: Message,
        from: SocketAddr,
        family: Family,
    },
    /// The handle gave up after repeated I/O failures. Sent once per handle.
    Lost { family: Family, error: io::Error },
}

struct Outbound {
    bytes: Vec<u8>,
    target: SocketAddr,
}

#[derive(Clone)]
struct Retry {
    attempts: u32,
    base: Duration,
}

impl Retry {
    fn backoff(&self, failure: u32) -> Duration {
        self.base * 2u32.saturating_pow(failure.saturating_sub(1))
    }
}

/// One per address family. A reader thread parses datagrams for the engine
/// and drops malformed ones; a writer thread drains the send queue.
pub struct TransportHandle {
    family: Family,
    link: Arc<dyn Link>,
    group: SocketAddr,
    queue: flume::Sender<Outbound>,
    in_flight: Arc<AtomicUsize>,
    alive: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl TransportHandle {
    /// Checks the permission, opens a link and starts its reader and writer
    /// threads. Any failure here is fatal for the caller.
    pub fn open(
        factory: &dyn LinkFactory,
        permission: &dyn NetworkPermission,
        family: Family,
        config: &EngineConfig,
        events: flume::Sender<TransportEvent>,
    ) -> Result<Self> {
        permission.check().map_err(Error::PermissionDenied)?;
        let link = factory.open(family, config)?;
        let retry = Retry {
            attempts: config.send_retries,
            base: config.retry_backoff(),
        };
        let alive = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));
        let (queue, outbound) = flume::unbounded::<Outbound>();
        let in_flight = Arc::new(AtomicUsize::new(0));

        let reader = Reader {
            link: link.clone(),
            family,
            events: events.clone(),
            alive: alive.clone(),
            stop: stop.clone(),
            retry: retry.clone(),
        };
        let started = thread::Builder::new()
            .name(format!("dnssd-recv-{family}"))
            .spawn(move || reader.run());
        if let Err(e) = started {
            link.close();
            return Err(e.into());
        }

        let writer = Writer {
            link: link.clone(),
            family,
            events,
            in_flight: in_flight.clone(),
            alive: alive.clone(),
            stop: stop.clone(),
            retry,
        };
        let started = thread::Builder::new()
            .name(format!("dnssd-send-{family}"))
            .spawn(move || writer.run(outbound));
        if let Err(e) = started {
            stop.store(true, Ordering::Release);
            link.close();
            return Err(e.into());
        }

        tracing::info!("Opened {} transport on {}", family, link.local_addr());
        Ok(Self {
            family,
            group: family.group(config.port),
            link,
            queue,
            in_flight,
            alive,
            stop,
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.link.local_addr()
    }

    pub fn host_addresses(&self) -> Vec<IpAddr> {
        self.link.host_addresses()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Serializes `message` and queues it. Returns false when the message
    /// could not be queued (dead handle or unencodable message).
    pub fn send(&self, message: &Message, destination: Destination) -> bool {
        if !self.is_alive() {
            return false;
        }
        let target = match destination {
            Destination::Multicast => self.group,
            Destination::Unicast(addr) if Family::of(&addr) == self.family => addr,
            Destination::Unicast(_) => return false,
        };
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to encode outbound message: {}", e);
                return false;
            }
        };
        if bytes.len() > MAX_PACKET_SIZE {
            tracing::warn!("Dropping {} byte message, larger than {}", bytes.len(), MAX_PACKET_SIZE);
            return false;
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if self.queue.send(Outbound { bytes, target }).is_err() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Packets queued or being written.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            self.alive.store(false, Ordering::Release);
            self.link.close();
            tracing::debug!("Closed {} transport", self.family);
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Flags the handle dead and reports it, once.
fn mark_lost(alive: &AtomicBool, events: &flume::Sender<TransportEvent>, family: Family, error: io::Error) {
    if alive.swap(false, Ordering::AcqRel) {
        tracing::error!("{} transport lost: {}", family, error);
        let _ = events.send(TransportEvent::Lost { family, error });
    }
}

struct Reader {
    link: Arc<dyn Link>,
    family: Family,
    events: flume::Sender<TransportEvent>,
    alive: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    retry: Retry,
}

impl Reader {
    fn run(self) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let mut failures = 0;
        while !self.stop.load(Ordering::Acquire) && self.alive.load(Ordering::Acquire) {
            match self.link.recv_from(&mut buf) {
                Ok((len, from)) => {
                    failures = 0;
                    match Message::decode(&buf[..len]) {
                        Ok(message) => {
                            let event = TransportEvent::Packet {
                                message,
                                from,
                                family: self.family,
                            };
                            if self.events.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::debug!("Dropping malformed packet from {}: {}", from, e),
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    if self.stop.load(Ordering::Acquire) {
                        break;
                    }
                    failures += 1;
                    if failures > self.retry.attempts {
                        mark_lost(&self.alive, &self.events, self.family, e);
                        break;
                    }
                    tracing::warn!("{} receive failed (attempt {}): {}", self.family, failures, e);
                    thread::sleep(self.retry.backoff(failures));
                }
            }
        }
        tracing::debug!("{} reader stopped", self.family);
    }
}

struct Writer {
    link: Arc<dyn Link>,
    family: Family,
    events: flume::Sender<TransportEvent>,
    in_flight: Arc<AtomicUsize>,
    alive: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    retry: Retry,
}

impl Writer {
    fn run(self, outbound: flume::Receiver<Outbound>) {
        for packet in outbound.iter() {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let mut failures = 0;
            loop {
                match self.link.send_to(&packet.bytes, packet.target) {
                    Ok(_) => break,
                    Err(e) => {
                        failures += 1;
                        if failures > self.retry.attempts {
                            self.in_flight.fetch_sub(1, Ordering::AcqRel);
                            mark_lost(&self.alive, &self.events, self.family, e);
                            return;
                        }
                        tracing::warn!(
                            "{} send to {} failed (attempt {}): {}",
                            self.family,
                            packet.target,
                            failures,
                            e
                        );
                        thread::sleep(self.retry.backoff(failures));
                    }
                }
            }
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        tracing::debug!("{} writer stopped", self.family);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{Question, RecordType};
    use memory::MemoryNetwork;

    struct Deny;

    impl NetworkPermission for Deny {
        fn check(&self) -> std::result::Result<(), String> {
            Err("local network access not granted".to_string())
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            retry_backoff_ms: 1,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_permission_denied_before_open() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = flume::unbounded();
        let result = TransportHandle::open(&network, &Deny, Family::V4, &test_config(), tx);
        assert!(matches!(result, Err(Error::PermissionDenied(_))));
        assert_eq!(network.members(), 0);
    }

    #[test]
    fn test_multicast_reaches_every_member() {
        let network = MemoryNetwork::new();
        let (tx_a, rx_a) = flume::unbounded();
        let (tx_b, rx_b) = flume::unbounded();
        let a = TransportHandle::open(&network, &AllowAll, Family::V4, &test_config(), tx_a).unwrap();
        let _b = TransportHandle::open(&network, &AllowAll, Family::V4, &test_config(), tx_b).unwrap();

        let mut query = Message::query();
        query.questions.push(Question::new("_ipp._tcp.local.", RecordType::Ptr));
        assert!(a.send(&query, Destination::Multicast));

        for rx in [&rx_a, &rx_b] {
            match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                TransportEvent::Packet { message, from, .. } => {
                    assert_eq!(message.questions[0].name, "_ipp._tcp.local.");
                    assert_eq!(from, a.local_addr());
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_malformed_packets_are_dropped() {
        let network = MemoryNetwork::new();
        let (tx, rx) = flume::unbounded();
        let _handle = TransportHandle::open(&network, &AllowAll, Family::V4, &test_config(), tx).unwrap();
        let raw = network.raw_link(Family::V4, 5353);
        raw.send_to(&[0xde, 0xad], Family::V4.group(5353)).unwrap();

        let mut query = Message::query();
        query.questions.push(Question::new("x.local.", RecordType::A));
        raw.send_to(&query.encode().unwrap(), Family::V4.group(5353)).unwrap();

        // only the well-formed query arrives
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            TransportEvent::Packet { message, .. } => assert_eq!(message.questions[0].name, "x.local."),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_severed_link_is_reported_once() {
        let network = MemoryNetwork::new();
        let (tx, rx) = flume::unbounded();
        let handle = TransportHandle::open(&network, &AllowAll, Family::V4, &test_config(), tx).unwrap();
        network.sever(handle.local_addr());

        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            TransportEvent::Lost { family, .. } => assert_eq!(family, Family::V4),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!handle.is_alive());
        assert!(!handle.send(&Message::query(), Destination::Multicast));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
