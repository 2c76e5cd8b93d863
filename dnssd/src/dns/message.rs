use std::collections::HashMap;
use tokio::time::Instant;

use super::name::{read_name, write_name};
use super::record::{RecordType, ResourceRecord, CLASS_IN, CLASS_TOP_BIT};
use super::MalformedPacket;

const HEADER_LEN: usize = 12;
const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;
/// Smallest possible question (root name + type + class).
const MIN_QUESTION_LEN: usize = 5;
/// Smallest possible record (root name + fixed fields).
const MIN_RECORD_LEN: usize = 11;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: RecordType,
    /// QU bit: the querier asks for a unicast reply.
    pub unicast_response: bool,
}

impl Question {
    pub fn new(name: impl Into<String>, qtype: RecordType) -> Self {
        Self {
            name: name.into(),
            qtype,
            unicast_response: false,
        }
    }

    pub fn unicast(name: impl Into<String>, qtype: RecordType) -> Self {
        Self {
            unicast_response: true,
            ..Self::new(name, qtype)
        }
    }
}

/// A DNS message. mDNS queries and unsolicited responses use id 0.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

impl Message {
    pub fn query() -> Self {
        Self::default()
    }

    /// Authoritative response, as every mDNS responder sends.
    pub fn response() -> Self {
        Self {
            flags: FLAG_RESPONSE | FLAG_AUTHORITATIVE,
            ..Self::default()
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
            && self.answers.is_empty()
            && self.authorities.is_empty()
            && self.additionals.is_empty()
    }

    /// Records a receiver should merge into its cache.
    pub fn records(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.answers.iter().chain(self.additionals.iter())
    }

    pub fn encode(&self) -> Result<Vec<u8>, MalformedPacket> {
        let mut buf = Vec::with_capacity(512);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        for count in [
            self.questions.len(),
            self.answers.len(),
            self.authorities.len(),
            self.additionals.len(),
        ] {
            let count = u16::try_from(count).map_err(|_| MalformedPacket::SectionTooLong)?;
            buf.extend_from_slice(&count.to_be_bytes());
        }

        let mut offsets = HashMap::new();
        for question in &self.questions {
            write_name(&mut buf, &question.name, &mut offsets)?;
            buf.extend_from_slice(&question.qtype.code().to_be_bytes());
            let class = if question.unicast_response {
                CLASS_IN | CLASS_TOP_BIT
            } else {
                CLASS_IN
            };
            buf.extend_from_slice(&class.to_be_bytes());
        }
        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            record.encode(&mut buf, &mut offsets)?;
        }
        Ok(buf)
    }

    pub fn decode(packet: &[u8]) -> Result<Self, MalformedPacket> {
        let header = packet.get(..HEADER_LEN).ok_or(MalformedPacket::Truncated)?;
        let word = |i: usize| u16::from_be_bytes([header[i], header[i + 1]]);
        let id = word(0);
        let flags = word(2);
        let opcode = ((flags >> 11) & 0x0F) as u8;
        let rcode = (flags & 0x0F) as u8;
        if opcode != 0 || rcode != 0 {
            return Err(MalformedPacket::Unsupported { opcode, rcode });
        }
        let counts = [word(4), word(6), word(8), word(10)].map(usize::from);

        let body = packet.len() - HEADER_LEN;
        if counts[0] * MIN_QUESTION_LEN + (counts[1] + counts[2] + counts[3]) * MIN_RECORD_LEN > body {
            return Err(MalformedPacket::Truncated);
        }

        let received_at = Instant::now();
        let mut pos = HEADER_LEN;
        let mut questions = Vec::with_capacity(counts[0]);
        for _ in 0..counts[0] {
            let (name, after) = read_name(packet, pos)?;
            let fixed = packet.get(after..after + 4).ok_or(MalformedPacket::Truncated)?;
            let qtype = RecordType::from_code(u16::from_be_bytes([fixed[0], fixed[1]]));
            let class = u16::from_be_bytes([fixed[2], fixed[3]]);
            questions.push(Question {
                name,
                qtype,
                unicast_response: class & CLASS_TOP_BIT != 0,
            });
            pos = after + 4;
        }

        let mut sections: [Vec<ResourceRecord>; 3] = Default::default();
        for (section, &count) in sections.iter_mut().zip(&counts[1..]) {
            section.reserve(count);
            for _ in 0..count {
                let (record, after) = ResourceRecord::decode(packet, pos, received_at)?;
                section.push(record);
                pos = after;
            }
        }
        let [answers, authorities, additionals] = sections;

        Ok(Self {
            id,
            flags,
            questions,
            answers,
            authorities,
            additionals,
        })
    }
}
