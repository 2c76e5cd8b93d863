use std::collections::HashMap;

use super::MalformedPacket;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_JUMPS: usize = 64;
const POINTER_LIMIT: usize = 0x3FFF;

/// Splits a name into raw, unescaped labels. Names are presentation strings
/// with a trailing dot; a dot or backslash inside a label is escaped as `\.`
/// or `\\`.
pub fn labels(name: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '.' => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

pub fn escape_label(label: &str) -> String {
    label.replace('\\', "\\\\").replace('.', "\\.")
}

/// Joins raw labels back into a fully qualified name.
pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> String {
    if labels.is_empty() {
        return ".".to_string();
    }
    let mut out = String::new();
    for label in labels {
        out.push_str(&escape_label(label.as_ref()));
        out.push('.');
    }
    out
}

/// Comparison form of a name: fully qualified and ASCII-lowercased.
pub fn canonical(name: &str) -> String {
    from_labels(&labels(name)).to_ascii_lowercase()
}

/// `<instance>.<service type>.<domain>` with the instance label escaped.
pub fn instance_fullname(instance: &str, ty_domain: &str) -> String {
    format!("{}.{}", escape_label(instance), from_labels(&labels(ty_domain)))
}

/// Writes `name` at the end of `buf`, reusing earlier suffixes recorded in
/// `offsets`. Offsets are relative to the start of the message, so `buf` must
/// hold the message from its first byte. Suffixes only match byte for byte,
/// so a pointer never changes the spelling a receiver sees.
pub(crate) fn write_name(
    buf: &mut Vec<u8>,
    name: &str,
    offsets: &mut HashMap<String, usize>,
) -> Result<(), MalformedPacket> {
    let labels = labels(name);
    let wire_len: usize = labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1;
    if wire_len > MAX_NAME_LEN {
        return Err(MalformedPacket::NameTooLong);
    }

    for i in 0..labels.len() {
        let suffix = from_labels(&labels[i..]);
        if let Some(&offset) = offsets.get(&suffix) {
            let pointer = 0xC000 | offset as u16;
            buf.extend_from_slice(&pointer.to_be_bytes());
            return Ok(());
        }
        if buf.len() <= POINTER_LIMIT {
            offsets.insert(suffix, buf.len());
        }
        let bytes = labels[i].as_bytes();
        if bytes.len() > MAX_LABEL_LEN {
            return Err(MalformedPacket::LabelTooLong);
        }
        buf.push(bytes.len() as u8);
        buf.extend_from_slice(bytes);
    }
    buf.push(0);
    Ok(())
}

/// Reads a possibly compressed name starting at `pos`. Returns the name and
/// the offset just past it in the original (uncompressed) position.
pub(crate) fn read_name(packet: &[u8], mut pos: usize) -> Result<(String, usize), MalformedPacket> {
    let mut labels = Vec::new();
    let mut resume_at = None;
    let mut jumps = 0;
    let mut total = 1;

    loop {
        let len = *packet.get(pos).ok_or(MalformedPacket::Truncated)? as usize;
        match len & 0xC0 {
            0x00 => {
                if len == 0 {
                    pos += 1;
                    break;
                }
                let start = pos + 1;
                let raw = packet
                    .get(start..start + len)
                    .ok_or(MalformedPacket::Truncated)?;
                total += len + 1;
                if total > MAX_NAME_LEN {
                    return Err(MalformedPacket::NameTooLong);
                }
                labels.push(String::from_utf8_lossy(raw).into_owned());
                pos = start + len;
            }
            0xC0 => {
                let low = *packet.get(pos + 1).ok_or(MalformedPacket::Truncated)? as usize;
                let target = ((len & 0x3F) << 8) | low;
                if resume_at.is_none() {
                    resume_at = Some(pos + 2);
                }
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS || target >= packet.len() {
                    return Err(MalformedPacket::BadPointer(target));
                }
                pos = target;
            }
            _ => return Err(MalformedPacket::BadLabelType(len as u8)),
        }
    }

    Ok((from_labels(&labels), resume_at.unwrap_or(pos)))
}
