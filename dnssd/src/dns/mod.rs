mod message;
pub mod name;
mod record;

pub use message::{Message, Question};
pub use record::{RData, RecordKey, RecordType, ResourceRecord, TxtPair, CLASS_IN};

/// Why a datagram could not be parsed or encoded.
///
/// Never returned to engine callers: multicast traffic from other devices is
/// untrusted, so the transport logs these and drops the packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedPacket {
    #[error("packet truncated")]
    Truncated,
    #[error("compression pointer to offset {0} is invalid")]
    BadPointer(usize),
    #[error("unsupported label type 0x{0:02x}")]
    BadLabelType(u8),
    #[error("label longer than 63 bytes")]
    LabelTooLong,
    #[error("name longer than 255 bytes")]
    NameTooLong,
    #[error("txt attribute longer than 255 bytes")]
    TxtTooLong,
    #[error("rdata longer than 65535 bytes")]
    RdataTooLong,
    #[error("more than 65535 entries in one section")]
    SectionTooLong,
    #[error("rdata length does not match {0} record")]
    RdataLength(RecordType),
    #[error("opcode {opcode} / rcode {rcode} is not used by mDNS")]
    Unsupported { opcode: u8, rcode: u8 },
}
