use std::net::{Ipv4Addr, Ipv6Addr};

/// UDP port used by multicast DNS (RFC 6762 section 3)
pub const MDNS_PORT: u16 = 5353;

/// IPv4 link-local multicast group for mDNS
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// IPv6 link-local multicast group for mDNS
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// Domain every service is published in
pub const DEFAULT_DOMAIN: &str = "local.";

/// Meta-query name listing every service type on the link (RFC 6763 section 9)
pub const SERVICE_TYPE_ENUMERATION: &str = "_services._dns-sd._udp.local.";

/// TTL of SRV, TXT and address records
pub const RECORD_TTL_SECS: u32 = 120;

/// TTL of the PTR records used for service instance enumeration
pub const PTR_TTL_SECS: u32 = 225;

/// Largest datagram the engine sends or accepts
pub const MAX_PACKET_SIZE: usize = 9000;

/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// Service type the daemon advertises its HTTP API under
pub const DAEMON_SERVICE_TYPE: &str = "_dnssd-api._tcp";

/// TXT key carrying the API path prefix
pub const TXT_API_PATH: &str = "path";
