use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use if_addrs::Interface;
use socket2::{Domain, Protocol, Socket, Type};
use shared::protocol::{MDNS_GROUP_V4, MDNS_GROUP_V6};

use super::{Family, Link, LinkFactory};
use crate::config::EngineConfig;

const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Opens one socket per family, bound to the wildcard address and joined to
/// the group on every selected interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketFactory;

impl LinkFactory for SocketFactory {
    fn open(&self, family: Family, config: &EngineConfig) -> io::Result<Arc<dyn Link>> {
        Ok(Arc::new(MulticastSocket::open(family, config)?))
    }
}

/// Non-loopback interfaces of `family`, filtered by the configured names.
fn select_interfaces(family: Family, allow: &[String]) -> io::Result<Vec<Interface>> {
    let selected = if_addrs::get_if_addrs()?
        .into_iter()
        .filter(|intf| !intf.is_loopback())
        .filter(|intf| match (family, intf.ip()) {
            (Family::V4, IpAddr::V4(_)) => true,
            (Family::V6, IpAddr::V6(_)) => true,
            _ => false,
        })
        .filter(|intf| allow.is_empty() || allow.iter().any(|name| name == &intf.name))
        .collect();
    Ok(selected)
}

fn new_socket(addr: SocketAddr) -> io::Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_read_timeout(Some(READ_TIMEOUT))?;
    socket.bind(&addr.into())?;
    tracing::debug!("New socket bound to {}", addr);
    Ok(socket)
}

pub struct MulticastSocket {
    family: Family,
    socket: Socket,
    udp: UdpSocket,
    interfaces: Vec<Interface>,
}

impl MulticastSocket {
    pub fn open(family: Family, config: &EngineConfig) -> io::Result<Self> {
        let interfaces = select_interfaces(family, &config.interfaces)?;
        let bind = match family {
            Family::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port),
            Family::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), config.port),
        };
        let socket = new_socket(bind)?;

        match family {
            Family::V4 => {
                socket.set_multicast_loop_v4(true)?;
                socket.set_multicast_ttl_v4(255)?;
            }
            Family::V6 => {
                socket.set_multicast_loop_v6(true)?;
                socket.set_multicast_hops_v6(255)?;
            }
        }

        let mut joined = 0;
        for intf in &interfaces {
            let result = match (family, intf.ip()) {
                (Family::V4, IpAddr::V4(ip)) => socket.join_multicast_v4(&MDNS_GROUP_V4, &ip),
                (Family::V6, _) => socket.join_multicast_v6(&MDNS_GROUP_V6, intf.index.unwrap_or(0)),
                _ => continue,
            };
            match result {
                Ok(()) => joined += 1,
                Err(e) => tracing::warn!("Failed to join {} group on {}: {}", family, intf.name, e),
            }
        }
        if joined == 0 {
            // No usable interface; let the kernel pick one.
            match family {
                Family::V4 => socket.join_multicast_v4(&MDNS_GROUP_V4, &Ipv4Addr::UNSPECIFIED)?,
                Family::V6 => socket.join_multicast_v6(&MDNS_GROUP_V6, 0)?,
            }
        }

        let udp: UdpSocket = socket.try_clone()?.into();
        tracing::info!(
            "Joined {} group on {} interface(s) via port {}",
            family,
            joined.max(1),
            config.port
        );
        Ok(Self {
            family,
            socket,
            udp,
            interfaces,
        })
    }

    fn send_multicast(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.interfaces.is_empty() {
            return self.udp.send_to(buf, target);
        }
        let mut last_err = None;
        let mut sent = None;
        for intf in &self.interfaces {
            let selected = match (self.family, intf.ip()) {
                (Family::V4, IpAddr::V4(ip)) => self.socket.set_multicast_if_v4(&ip),
                (Family::V6, _) => self.socket.set_multicast_if_v6(intf.index.unwrap_or(0)),
                _ => continue,
            };
            match selected.and_then(|()| self.udp.send_to(buf, target)) {
                Ok(len) => sent = Some(len),
                Err(e) => {
                    tracing::debug!("Multicast send on {} failed: {}", intf.name, e);
                    last_err = Some(e);
                }
            }
        }
        match (sent, last_err) {
            (Some(len), _) => Ok(len),
            (None, Some(e)) => Err(e),
            (None, None) => self.udp.send_to(buf, target),
        }
    }
}

impl Link for MulticastSocket {
    fn family(&self) -> Family {
        self.family
    }

    fn local_addr(&self) -> SocketAddr {
        self.udp
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    fn host_addresses(&self) -> Vec<IpAddr> {
        self.interfaces.iter().map(|intf| intf.ip()).collect()
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.udp.recv_from(buf)
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if target.ip().is_multicast() {
            self.send_multicast(buf, target)
        } else {
            self.udp.send_to(buf, target)
        }
    }

    fn close(&self) {
        for intf in &self.interfaces {
            let _ = match (self.family, intf.ip()) {
                (Family::V4, IpAddr::V4(ip)) => self.socket.leave_multicast_v4(&MDNS_GROUP_V4, &ip),
                (Family::V6, _) => self.socket.leave_multicast_v6(&MDNS_GROUP_V6, intf.index.unwrap_or(0)),
                _ => continue,
            };
        }
        // Wakes the reader out of its blocking receive.
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }
}
