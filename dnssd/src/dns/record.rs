use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::time::Instant;

use super::name::{canonical, read_name, write_name};
use super::MalformedPacket;

/// DNS class IN.
pub const CLASS_IN: u16 = 1;

/// Top bit of the class field: cache-flush on records, QU on questions.
pub(crate) const CLASS_TOP_BIT: u16 = 0x8000;

/// One TXT attribute: key plus optional raw value.
pub type TxtPair = (String, Option<Vec<u8>>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordType {
    A,
    Ptr,
    Txt,
    Aaaa,
    Srv,
    /// Only valid in questions.
    Any,
    Other(u16),
}

impl RecordType {
    pub fn code(self) -> u16 {
        match self {
            Self::A => 1,
            Self::Ptr => 12,
            Self::Txt => 16,
            Self::Aaaa => 28,
            Self::Srv => 33,
            Self::Any => 255,
            Self::Other(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Self::A,
            12 => Self::Ptr,
            16 => Self::Txt,
            28 => Self::Aaaa,
            33 => Self::Srv,
            255 => Self::Any,
            other => Self::Other(other),
        }
    }

    /// Whether a question of this type asks for records of type `other`.
    pub fn matches(self, other: RecordType) -> bool {
        self == Self::Any || self == other
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::Ptr => write!(f, "PTR"),
            Self::Txt => write!(f, "TXT"),
            Self::Aaaa => write!(f, "AAAA"),
            Self::Srv => write!(f, "SRV"),
            Self::Any => write!(f, "ANY"),
            Self::Other(code) => write!(f, "TYPE{code}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(String),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Txt(Vec<TxtPair>),
    Other { rtype: u16, data: Vec<u8> },
}

impl RData {
    pub fn rtype(&self) -> RecordType {
        match self {
            Self::A(_) => RecordType::A,
            Self::Aaaa(_) => RecordType::Aaaa,
            Self::Ptr(_) => RecordType::Ptr,
            Self::Srv { .. } => RecordType::Srv,
            Self::Txt(_) => RecordType::Txt,
            Self::Other { rtype, .. } => RecordType::Other(*rtype),
        }
    }

    pub fn address(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::A(v4),
            IpAddr::V6(v6) => Self::Aaaa(v6),
        }
    }

    /// Part of the rdata that distinguishes records sharing a name and type.
    /// SRV and TXT are unique per owner name, so their key is empty and a
    /// newer record replaces the older one.
    fn identity(&self) -> String {
        match self {
            Self::A(ip) => ip.to_string(),
            Self::Aaaa(ip) => ip.to_string(),
            Self::Ptr(target) => canonical(target),
            Self::Srv { .. } | Self::Txt(_) => String::new(),
            Self::Other { data, .. } => data.iter().map(|b| format!("{b:02x}")).collect(),
        }
    }

    /// TXT pairs as a map, first occurrence of a key wins (RFC 6763 section 6.4).
    pub fn txt_map(pairs: &[TxtPair]) -> BTreeMap<String, Option<Vec<u8>>> {
        let mut map = BTreeMap::new();
        for (key, value) in pairs {
            map.entry(key.clone()).or_insert_with(|| value.clone());
        }
        map
    }
}

/// Cache identity of a record: owner name, type and rdata key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub name: String,
    pub rtype: RecordType,
    pub rdata: String,
}

/// A parsed or to-be-sent resource record. Immutable: the `with_*` methods
/// return a new record.
#[derive(Debug, Clone)]
pub struct ResourceRecord {
    name: String,
    class: u16,
    cache_flush: bool,
    ttl: u32,
    rdata: RData,
    received_at: Instant,
}

impl ResourceRecord {
    pub fn new(name: impl Into<String>, ttl: u32, rdata: RData) -> Self {
        Self {
            name: name.into(),
            class: CLASS_IN,
            cache_flush: false,
            ttl,
            rdata,
            received_at: Instant::now(),
        }
    }

    pub fn with_cache_flush(&self, cache_flush: bool) -> Self {
        Self {
            cache_flush,
            ..self.clone()
        }
    }

    pub fn with_ttl(&self, ttl: u32) -> Self {
        Self { ttl, ..self.clone() }
    }

    pub fn with_received_at(&self, received_at: Instant) -> Self {
        Self {
            received_at,
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rtype(&self) -> RecordType {
        self.rdata.rtype()
    }

    pub fn class(&self) -> u16 {
        self.class
    }

    pub fn cache_flush(&self) -> bool {
        self.cache_flush
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn rdata(&self) -> &RData {
        &self.rdata
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn expires_at(&self) -> Instant {
        self.received_at + Duration::from_secs(u64::from(self.ttl))
    }

    /// TTL 0 announces the record's removal.
    pub fn is_goodbye(&self) -> bool {
        self.ttl == 0
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            name: canonical(&self.name),
            rtype: self.rtype(),
            rdata: self.rdata.identity(),
        }
    }

    /// Same owner, type and rdata; TTL and timestamps are ignored.
    pub fn same_data(&self, other: &ResourceRecord) -> bool {
        canonical(&self.name) == canonical(&other.name) && self.rdata == other.rdata
    }

    pub(crate) fn encode(
        &self,
        buf: &mut Vec<u8>,
        offsets: &mut HashMap<String, usize>,
    ) -> Result<(), MalformedPacket> {
        write_name(buf, &self.name, offsets)?;
        buf.extend_from_slice(&self.rtype().code().to_be_bytes());
        let class = if self.cache_flush {
            self.class | CLASS_TOP_BIT
        } else {
            self.class
        };
        buf.extend_from_slice(&class.to_be_bytes());
        buf.extend_from_slice(&self.ttl.to_be_bytes());

        let length_at = buf.len();
        buf.extend_from_slice(&[0, 0]);
        self.encode_rdata(buf, offsets)?;
        let rdlength =
            u16::try_from(buf.len() - length_at - 2).map_err(|_| MalformedPacket::RdataTooLong)?;
        buf[length_at..length_at + 2].copy_from_slice(&rdlength.to_be_bytes());
        Ok(())
    }

    fn encode_rdata(
        &self,
        buf: &mut Vec<u8>,
        offsets: &mut HashMap<String, usize>,
    ) -> Result<(), MalformedPacket> {
        match &self.rdata {
            RData::A(ip) => buf.extend_from_slice(&ip.octets()),
            RData::Aaaa(ip) => buf.extend_from_slice(&ip.octets()),
            RData::Ptr(target) => write_name(buf, target, offsets)?,
            RData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                buf.extend_from_slice(&priority.to_be_bytes());
                buf.extend_from_slice(&weight.to_be_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
                write_name(buf, target, offsets)?;
            }
            RData::Txt(pairs) => encode_txt(buf, pairs)?,
            RData::Other { data, .. } => buf.extend_from_slice(data),
        }
        Ok(())
    }

    /// Rdata as it goes on the wire with no name compression. Simultaneous
    /// claims on one name are ordered by these bytes (RFC 6762 section 8.2).
    pub(crate) fn rdata_bytes(&self) -> Result<Vec<u8>, MalformedPacket> {
        let mut buf = Vec::new();
        self.encode_rdata(&mut buf, &mut HashMap::new())?;
        Ok(buf)
    }

    pub(crate) fn decode(
        packet: &[u8],
        pos: usize,
        received_at: Instant,
    ) -> Result<(Self, usize), MalformedPacket> {
        let (name, pos) = read_name(packet, pos)?;
        let fixed = packet.get(pos..pos + 10).ok_or(MalformedPacket::Truncated)?;
        let rtype = RecordType::from_code(u16::from_be_bytes([fixed[0], fixed[1]]));
        let class = u16::from_be_bytes([fixed[2], fixed[3]]);
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        let start = pos + 10;
        let end = start + rdlength;
        let raw = packet.get(start..end).ok_or(MalformedPacket::Truncated)?;

        let rdata = match rtype {
            RecordType::A => {
                let octets: [u8; 4] = raw.try_into().map_err(|_| MalformedPacket::RdataLength(rtype))?;
                RData::A(Ipv4Addr::from(octets))
            }
            RecordType::Aaaa => {
                let octets: [u8; 16] = raw.try_into().map_err(|_| MalformedPacket::RdataLength(rtype))?;
                RData::Aaaa(Ipv6Addr::from(octets))
            }
            RecordType::Ptr => {
                let (target, after) = read_name(packet, start)?;
                if after != end {
                    return Err(MalformedPacket::RdataLength(rtype));
                }
                RData::Ptr(target)
            }
            RecordType::Srv => {
                if raw.len() < 7 {
                    return Err(MalformedPacket::RdataLength(rtype));
                }
                let (target, after) = read_name(packet, start + 6)?;
                if after != end {
                    return Err(MalformedPacket::RdataLength(rtype));
                }
                RData::Srv {
                    priority: u16::from_be_bytes([raw[0], raw[1]]),
                    weight: u16::from_be_bytes([raw[2], raw[3]]),
                    port: u16::from_be_bytes([raw[4], raw[5]]),
                    target,
                }
            }
            RecordType::Txt => RData::Txt(decode_txt(raw)?),
            RecordType::Any | RecordType::Other(_) => RData::Other {
                rtype: rtype.code(),
                data: raw.to_vec(),
            },
        };

        let record = Self {
            name,
            class: class & !CLASS_TOP_BIT,
            cache_flush: class & CLASS_TOP_BIT != 0,
            ttl,
            rdata,
            received_at,
        };
        Ok((record, end))
    }
}

fn encode_txt(buf: &mut Vec<u8>, pairs: &[TxtPair]) -> Result<(), MalformedPacket> {
    if pairs.is_empty() {
        // an empty TXT record still carries one empty string
        buf.push(0);
        return Ok(());
    }
    for (key, value) in pairs {
        let mut entry = key.as_bytes().to_vec();
        if let Some(value) = value {
            entry.push(b'=');
            entry.extend_from_slice(value);
        }
        if entry.len() > 255 {
            return Err(MalformedPacket::TxtTooLong);
        }
        buf.push(entry.len() as u8);
        buf.extend_from_slice(&entry);
    }
    Ok(())
}

fn decode_txt(mut raw: &[u8]) -> Result<Vec<TxtPair>, MalformedPacket> {
    let mut pairs = Vec::new();
    while let Some((&len, rest)) = raw.split_first() {
        let len = len as usize;
        let entry = rest.get(..len).ok_or(MalformedPacket::Truncated)?;
        raw = &rest[len..];
        if entry.is_empty() {
            continue;
        }
        match entry.iter().position(|&b| b == b'=') {
            Some(0) => continue,
            Some(eq) => pairs.push((
                String::from_utf8_lossy(&entry[..eq]).into_owned(),
                Some(entry[eq + 1..].to_vec()),
            )),
            None => pairs.push((String::from_utf8_lossy(entry).into_owned(), None)),
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: &ResourceRecord) -> ResourceRecord {
        let mut buf = Vec::new();
        record.encode(&mut buf, &mut HashMap::new()).unwrap();
        let (decoded, end) = ResourceRecord::decode(&buf, 0, Instant::now()).unwrap();
        assert_eq!(end, buf.len());
        decoded
    }

    #[test]
    fn test_srv_keeps_cache_flush_and_target() {
        let record = ResourceRecord::new(
            "printer._ipp._tcp.local.",
            120,
            RData::Srv {
                priority: 0,
                weight: 1,
                port: 631,
                target: "office.local.".to_string(),
            },
        )
        .with_cache_flush(true);
        let decoded = roundtrip(&record);
        assert!(decoded.cache_flush());
        assert_eq!(decoded.class(), CLASS_IN);
        assert_eq!(decoded.ttl(), 120);
        assert!(decoded.same_data(&record));
    }

    #[test]
    fn test_txt_flags_and_empty_values() {
        let pairs = vec![
            ("path".to_string(), Some(b"/api".to_vec())),
            ("secure".to_string(), None),
            ("empty".to_string(), Some(Vec::new())),
        ];
        let record = ResourceRecord::new("x._http._tcp.local.", 120, RData::Txt(pairs.clone()));
        let decoded = roundtrip(&record);
        assert_eq!(decoded.rdata(), &RData::Txt(pairs));
    }

    #[test]
    fn test_empty_txt_is_single_zero_byte() {
        let record = ResourceRecord::new("x._http._tcp.local.", 120, RData::Txt(Vec::new()));
        let mut buf = Vec::new();
        record.encode(&mut buf, &mut HashMap::new()).unwrap();
        assert_eq!(&buf[buf.len() - 3..], &[0, 1, 0]);
        assert_eq!(roundtrip(&record).rdata(), &RData::Txt(Vec::new()));
    }

    #[test]
    fn test_bad_address_length() {
        let record = ResourceRecord::new("host.local.", 120, RData::A(Ipv4Addr::LOCALHOST));
        let mut buf = Vec::new();
        record.encode(&mut buf, &mut HashMap::new()).unwrap();
        // claim 3 bytes of rdata instead of 4
        let len_at = buf.len() - 6;
        buf[len_at..len_at + 2].copy_from_slice(&3u16.to_be_bytes());
        buf.pop();
        assert_eq!(
            ResourceRecord::decode(&buf, 0, Instant::now()).unwrap_err(),
            MalformedPacket::RdataLength(RecordType::A)
        );
    }

    #[test]
    fn test_keys() {
        let a = ResourceRecord::new("Host.local.", 120, RData::A(Ipv4Addr::new(10, 0, 0, 1)));
        let b = ResourceRecord::new("host.local.", 120, RData::A(Ipv4Addr::new(10, 0, 0, 2)));
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key().name, "host.local.");

        let txt1 = ResourceRecord::new("x._http._tcp.local.", 120, RData::Txt(Vec::new()));
        let txt2 = ResourceRecord::new(
            "x._http._tcp.local.",
            120,
            RData::Txt(vec![("a".to_string(), None)]),
        );
        assert_eq!(txt1.key(), txt2.key());
        assert!(!txt1.same_data(&txt2));
    }

    #[test]
    fn test_txt_map_first_key_wins() {
        let map = RData::txt_map(&[
            ("a".to_string(), Some(b"1".to_vec())),
            ("a".to_string(), Some(b"2".to_vec())),
            ("b".to_string(), None),
        ]);
        assert_eq!(map.get("a"), Some(&Some(b"1".to_vec())));
        assert_eq!(map.get("b"), Some(&None));
    }

    #[test]
    fn test_oversized_rdata_is_an_encode_error() {
        let record = ResourceRecord::new(
            "blob.local.",
            120,
            RData::Other {
                rtype: 99,
                data: vec![0; usize::from(u16::MAX) + 1],
            },
        );
        let mut buf = Vec::new();
        assert_eq!(
            record.encode(&mut buf, &mut HashMap::new()),
            Err(MalformedPacket::RdataTooLong)
        );
    }

    #[test]
    fn test_rdata_bytes_are_uncompressed() {
        let record = ResourceRecord::new(
            "printer._ipp._tcp.local.",
            120,
            RData::Srv {
                priority: 0,
                weight: 0,
                port: 631,
                target: "office.local.".to_string(),
            },
        );
        assert_eq!(
            record.rdata_bytes().unwrap(),
            b"\x00\x00\x00\x00\x02\x77\x06office\x05local\x00".to_vec()
        );
    }
}
