//! Domain name encoding with RFC 1035 compression pointers.

use std::collections::HashMap;

use super::DnsError;
use crate::byte_order::write_network_u16;

/// Pointers followed before a name is considered cyclic.
pub const MAX_POINTER_HOPS: usize = 16;
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
const POINTER_TAG: u8 = 0xc0;
/// Largest offset a compression pointer can express.
const MAX_POINTER_OFFSET: usize = 0x3fff;

/// Decode the name at `offset`, following compression pointers.
///
/// Returns the dotted name and the number of bytes the name occupies at
/// `offset` itself, so the caller can continue past it.
///
/// # Errors
///
/// Returns [`DnsError::Truncated`] when a label or pointer runs past the
/// packet, [`DnsError::PointerLoop`] after [`MAX_POINTER_HOPS`] jumps and
/// [`DnsError::NameTooLong`] beyond 255 bytes.
///
/// # Examples
///
/// ```
/// use netmux::dns::uncompress_name;
///
/// // "a.b" at 0, then "c" followed by a pointer to offset 0.
/// let pkt = [1, b'a', 1, b'b', 0, 1, b'c', 0xc0, 0x00];
/// assert_eq!(uncompress_name(&pkt, 5).unwrap(), ("c.a.b".to_owned(), 4));
/// ```
pub fn uncompress_name(pkt: &[u8], offset: usize) -> Result<(String, usize), DnsError> {
    let mut name = String::new();
    let mut pos = offset;
    let mut consumed = None;
    let mut hops = 0;
    loop {
        let len = *pkt.get(pos).ok_or(DnsError::Truncated)?;
        match len & POINTER_TAG {
            0 => {}
            POINTER_TAG => {
                let low = *pkt.get(pos + 1).ok_or(DnsError::Truncated)?;
                consumed.get_or_insert(pos + 2 - offset);
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err(DnsError::PointerLoop);
                }
                pos = (usize::from(len & !POINTER_TAG) << 8) | usize::from(low);
                continue;
            }
            _ => return Err(DnsError::BadLabel(len)),
        }
        if len == 0 {
            let consumed = consumed.unwrap_or(pos + 1 - offset);
            return Ok((name, consumed));
        }
        let start = pos + 1;
        let label = pkt
            .get(start..start + usize::from(len))
            .ok_or(DnsError::Truncated)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        if name.len() > MAX_NAME_LEN {
            return Err(DnsError::NameTooLong);
        }
        pos = start + usize::from(len);
    }
}

fn labels(name: &str) -> Result<Vec<&str>, DnsError> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(DnsError::NameTooLong);
    }
    trimmed
        .split('.')
        .map(|l| match l.len() {
            0 => Err(DnsError::EmptyLabel),
            n if n > MAX_LABEL_LEN => Err(DnsError::LabelTooLong(n)),
            _ => Ok(l),
        })
        .collect()
}

fn put_label(out: &mut Vec<u8>, label: &str) {
    out.push(u8::try_from(label.len()).unwrap_or(0));
    out.extend_from_slice(label.as_bytes());
}

/// Append `name` uncompressed.
///
/// # Errors
///
/// Returns a [`DnsError`] for empty or oversized labels.
pub fn encode_name(out: &mut Vec<u8>, name: &str) -> Result<(), DnsError> {
    for label in labels(name)? {
        put_label(out, label);
    }
    out.push(0);
    Ok(())
}

/// Writes names into one packet, replacing repeated suffixes with pointers.
///
/// Offsets are positions in the packet buffer passed to
/// [`write`](Self::write), which must start with the DNS header.
#[derive(Debug, Default)]
pub struct NameCompressor {
    offsets: HashMap<String, usize>,
}

impl NameCompressor {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Append `name`, pointing at an earlier copy of its longest known
    /// suffix.
    ///
    /// # Errors
    ///
    /// Returns a [`DnsError`] for empty or oversized labels.
    pub fn write(&mut self, out: &mut Vec<u8>, name: &str) -> Result<(), DnsError> {
        let labels = labels(name)?;
        for i in 0..labels.len() {
            let suffix = labels[i..].join(".");
            if let Some(&at) = self.offsets.get(&suffix) {
                let pointer = u16::try_from(at).unwrap_or(0) | (u16::from(POINTER_TAG) << 8);
                out.extend_from_slice(&write_network_u16(pointer));
                return Ok(());
            }
            if out.len() <= MAX_POINTER_OFFSET {
                self.offsets.insert(suffix, out.len());
            }
            put_label(out, labels[i]);
        }
        out.push(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{DnsError, NameCompressor, encode_name, uncompress_name};

    #[test]
    fn compressor_reuses_suffixes() {
        let mut pkt = vec![0u8; 12];
        let mut c = NameCompressor::new();
        c.write(&mut pkt, "www.example.com").expect("valid name");
        let second = pkt.len();
        c.write(&mut pkt, "mail.example.com").expect("valid name");
        assert_eq!(&pkt[second..], &[4, b'm', b'a', b'i', b'l', 0xc0, 16]);
        assert_eq!(
            uncompress_name(&pkt, second).expect("decodable"),
            ("mail.example.com".to_owned(), 7)
        );
    }

    #[test]
    fn compressor_keeps_label_case() {
        let mut pkt = vec![0u8; 12];
        let mut c = NameCompressor::new();
        c.write(&mut pkt, "www.example.com").expect("valid name");
        let second = pkt.len();
        c.write(&mut pkt, "WWW.Example.COM").expect("valid name");
        assert_eq!(
            uncompress_name(&pkt, second).expect("decodable").0,
            "WWW.Example.COM"
        );
        let third = pkt.len();
        c.write(&mut pkt, "mail.Example.COM").expect("valid name");
        assert_eq!(&pkt[third..third + 5], b"\x04mail");
        assert_eq!(
            uncompress_name(&pkt, third).expect("decodable"),
            ("mail.Example.COM".to_owned(), 7)
        );
    }

    #[test]
    fn self_pointer_is_a_loop() {
        assert_eq!(uncompress_name(&[0xc0, 0x00], 0), Err(DnsError::PointerLoop));
    }

    #[rstest]
    #[case::truncated_label(&[3, b'a', b'b'][..], DnsError::Truncated)]
    #[case::pointer_past_end(&[0xc0, 0x10][..], DnsError::Truncated)]
    #[case::reserved_label_type(&[0x40][..], DnsError::BadLabel(0x40))]
    fn malformed_names(#[case] pkt: &[u8], #[case] expected: DnsError) {
        assert_eq!(uncompress_name(pkt, 0), Err(expected));
    }

    #[rstest]
    #[case::empty_label("a..b", DnsError::EmptyLabel)]
    #[case::long_label(&"x".repeat(64), DnsError::LabelTooLong(64))]
    fn unencodable_names(#[case] name: &str, #[case] expected: DnsError) {
        assert_eq!(encode_name(&mut Vec::new(), name), Err(expected));
    }

    #[test]
    fn root_name_is_a_single_zero() {
        let mut out = Vec::new();
        encode_name(&mut out, ".").expect("root");
        assert_eq!(out, [0]);
    }
}
