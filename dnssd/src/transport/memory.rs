use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{Family, Link, LinkFactory};
use crate::config::EngineConfig;

const READ_TIMEOUT: Duration = Duration::from_millis(50);

type Datagram = (Vec<u8>, SocketAddr);

struct Member {
    inbox: flume::Sender<Datagram>,
    severed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Hub {
    members: HashMap<SocketAddr, Member>,
    next_host: u32,
    datagrams: u64,
}

/// In-process multicast network. A datagram sent to a group address reaches
/// every link of the same family, the sender included, as with multicast
/// loopback on a real socket.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of links currently attached.
    pub fn members(&self) -> usize {
        lock(&self.hub).members.len()
    }

    /// Datagrams sent by all links so far.
    pub fn datagrams_sent(&self) -> u64 {
        lock(&self.hub).datagrams
    }

    /// Detaches the link at `addr` and makes its further I/O fail, as if the
    /// interface went away. Returns false if no such link exists.
    pub fn sever(&self, addr: SocketAddr) -> bool {
        match lock(&self.hub).members.remove(&addr) {
            Some(member) => {
                member.severed.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Severs every attached link. Returns how many there were.
    pub fn sever_all(&self) -> usize {
        let mut hub = lock(&self.hub);
        for member in hub.members.values() {
            member.severed.store(true, Ordering::Release);
        }
        let count = hub.members.len();
        hub.members.clear();
        count
    }

    /// Attaches a bare link, for injecting hand-made datagrams.
    pub fn raw_link(&self, family: Family, port: u16) -> MemoryLink {
        let (inbox, rx) = flume::unbounded();
        let severed = Arc::new(AtomicBool::new(false));
        let mut hub = lock(&self.hub);
        hub.next_host += 1;
        let addr = host_addr(family, hub.next_host, port);
        hub.members.insert(
            addr,
            Member {
                inbox,
                severed: severed.clone(),
            },
        );
        MemoryLink {
            addr,
            family,
            rx,
            severed,
            hub: self.hub.clone(),
        }
    }
}

impl LinkFactory for MemoryNetwork {
    fn open(&self, family: Family, config: &EngineConfig) -> io::Result<Arc<dyn Link>> {
        Ok(Arc::new(self.raw_link(family, config.port)))
    }
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn host_addr(family: Family, n: u32, port: u16) -> SocketAddr {
    let ip = match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::new(10, (n >> 16) as u8, (n >> 8) as u8, n as u8)),
        Family::V6 => IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, (n >> 16) as u16, n as u16)),
    };
    SocketAddr::new(ip, port)
}

pub struct MemoryLink {
    addr: SocketAddr,
    family: Family,
    rx: flume::Receiver<Datagram>,
    severed: Arc<AtomicBool>,
    hub: Arc<Mutex<Hub>>,
}

impl MemoryLink {
    fn check(&self) -> io::Result<()> {
        if self.severed.load(Ordering::Acquire) {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "link severed"))
        } else {
            Ok(())
        }
    }
}

impl Link for MemoryLink {
    fn family(&self) -> Family {
        self.family
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn host_addresses(&self) -> Vec<IpAddr> {
        vec![self.addr.ip()]
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.check()?;
        match self.rx.recv_timeout(READ_TIMEOUT) {
            Ok((bytes, from)) => {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok((len, from))
            }
            Err(flume::RecvTimeoutError::Timeout) => Err(io::ErrorKind::WouldBlock.into()),
            Err(flume::RecvTimeoutError::Disconnected) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "link detached"))
            }
        }
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.check()?;
        let mut hub = lock(&self.hub);
        hub.datagrams += 1;
        if target.ip().is_multicast() {
            for (addr, member) in &hub.members {
                if Family::of(addr) == self.family {
                    let _ = member.inbox.send((buf.to_vec(), self.addr));
                }
            }
        } else if let Some(member) = hub.members.get(&target) {
            let _ = member.inbox.send((buf.to_vec(), self.addr));
        }
        Ok(buf.len())
    }

    fn close(&self) {
        let mut hub = lock(&self.hub);
        let ours = hub
            .members
            .get(&self.addr)
            .is_some_and(|member| Arc::ptr_eq(&member.severed, &self.severed));
        if ours {
            hub.members.remove(&self.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unicast_reaches_only_target() {
        let network = MemoryNetwork::new();
        let a = network.raw_link(Family::V4, 5353);
        let b = network.raw_link(Family::V4, 5353);
        let c = network.raw_link(Family::V4, 5353);
        a.send_to(b"hello", b.local_addr()).unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, a.local_addr());
        assert_eq!(c.recv_from(&mut buf).unwrap_err().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(network.datagrams_sent(), 1);
    }

    #[test]
    fn test_families_are_separate() {
        let network = MemoryNetwork::new();
        let v4 = network.raw_link(Family::V4, 5353);
        let v6 = network.raw_link(Family::V6, 5353);
        v4.send_to(b"x", Family::V4.group(5353)).unwrap();

        let mut buf = [0u8; 4];
        assert!(v4.recv_from(&mut buf).is_ok());
        assert!(v6.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_close_detaches() {
        let network = MemoryNetwork::new();
        let a = network.raw_link(Family::V4, 5353);
        assert_eq!(network.members(), 1);
        a.close();
        assert_eq!(network.members(), 0);
    }
}
