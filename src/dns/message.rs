//! DNS message model and parser.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    ops::Range,
};

use bytes::Bytes;

use super::{
    DnsError,
    name::{encode_name, uncompress_name},
};
use crate::byte_order::{u16_at, u32_at, write_network_u16};

/// Size of the fixed message header.
pub const HEADER_LEN: usize = 12;
/// The `IN` record class.
pub const CLASS_IN: u16 = 1;
/// Header flag marking a response.
pub const FLAG_RESPONSE: u16 = 0x8000;
/// Header flag asking the server to recurse.
pub const FLAG_RECURSION_DESIRED: u16 = 0x0100;
/// Header flag announcing recursion support.
pub const FLAG_RECURSION_AVAILABLE: u16 = 0x0080;
const RCODE_MASK: u16 = 0x000f;

/// Resource record type code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordType(pub u16);

impl RecordType {
    pub const A: Self = Self(1);
    pub const NS: Self = Self(2);
    pub const CNAME: Self = Self(5);
    pub const PTR: Self = Self(12);
    pub const MX: Self = Self(15);
    pub const TXT: Self = Self(16);
    pub const AAAA: Self = Self(28);
    pub const SRV: Self = Self(33);
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::A => f.write_str("A"),
            Self::NS => f.write_str("NS"),
            Self::CNAME => f.write_str("CNAME"),
            Self::PTR => f.write_str("PTR"),
            Self::MX => f.write_str("MX"),
            Self::TXT => f.write_str("TXT"),
            Self::AAAA => f.write_str("AAAA"),
            Self::SRV => f.write_str("SRV"),
            Self(other) => write!(f, "TYPE{other}"),
        }
    }
}

/// Section a record was parsed from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Question,
    Answer,
}

/// One question or answer record.
///
/// Answers reference their data by position in the owning
/// [`DnsMessage`]; see [`DnsMessage::rdata`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub rtype: RecordType,
    pub rclass: u16,
    /// Zero for questions.
    pub ttl: u32,
    pub kind: RecordKind,
    rdata: Range<usize>,
}

/// Decoded payload of a well-known record type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Ptr(String),
    Ns(String),
    Mx { preference: u16, exchange: String },
    /// Raw bytes of any other type.
    Other(Bytes),
}

/// Parsed DNS message.
///
/// The raw packet is kept so record data and compressed names can be
/// decoded lazily.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsMessage {
    pkt: Bytes,
    pub transaction_id: u16,
    pub flags: u16,
    pub questions: Vec<Resource>,
    pub answers: Vec<Resource>,
}

struct Cursor<'a> {
    pkt: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn u16(&mut self) -> Result<u16, DnsError> {
        let v = u16_at(self.pkt, self.pos).ok_or(DnsError::Truncated)?;
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, DnsError> {
        let v = u32_at(self.pkt, self.pos).ok_or(DnsError::Truncated)?;
        self.pos += 4;
        Ok(v)
    }

    fn name(&mut self) -> Result<String, DnsError> {
        let (name, used) = uncompress_name(self.pkt, self.pos)?;
        self.pos += used;
        Ok(name)
    }

    fn record(&mut self, kind: RecordKind) -> Result<Resource, DnsError> {
        let name = self.name()?;
        let rtype = RecordType(self.u16()?);
        let rclass = self.u16()?;
        let (ttl, rdata) = match kind {
            RecordKind::Question => (0, self.pos..self.pos),
            RecordKind::Answer => {
                let ttl = self.u32()?;
                let len = usize::from(self.u16()?);
                let start = self.pos;
                if start + len > self.pkt.len() {
                    return Err(DnsError::Truncated);
                }
                self.pos += len;
                (ttl, start..start + len)
            }
        };
        Ok(Resource {
            name,
            rtype,
            rclass,
            ttl,
            kind,
            rdata,
        })
    }
}

impl DnsMessage {
    /// Parse a complete message.
    ///
    /// At most `max_questions` questions and `max_answers` answers are kept;
    /// records beyond the limits, and the authority and additional sections,
    /// are ignored.
    ///
    /// # Errors
    ///
    /// Returns a [`DnsError`] if the header or a kept record is truncated or
    /// contains a malformed name.
    pub fn parse(pkt: Bytes, max_questions: usize, max_answers: usize) -> Result<Self, DnsError> {
        if pkt.len() < HEADER_LEN {
            return Err(DnsError::Truncated);
        }
        let mut cur = Cursor { pkt: &pkt, pos: 0 };
        let transaction_id = cur.u16()?;
        let flags = cur.u16()?;
        let qdcount = usize::from(cur.u16()?).min(max_questions);
        let ancount = cur.u16()?;
        cur.pos = HEADER_LEN;
        let questions = (0..qdcount)
            .map(|_| cur.record(RecordKind::Question))
            .collect::<Result<Vec<_>, _>>()?;
        // Answers follow every question, so a truncated question list
        // leaves them unreachable.
        let ancount = if qdcount == usize::from(u16_at(&pkt, 4).unwrap_or(0)) {
            usize::from(ancount).min(max_answers)
        } else {
            0
        };
        let answers = (0..ancount)
            .map(|_| cur.record(RecordKind::Answer))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            pkt,
            transaction_id,
            flags,
            questions,
            answers,
        })
    }

    /// Raw packet bytes.
    #[must_use]
    pub fn packet(&self) -> &Bytes { &self.pkt }

    /// Whether the QR bit is set.
    #[must_use]
    pub fn is_response(&self) -> bool { self.flags & FLAG_RESPONSE != 0 }

    /// Response code from the header.
    #[must_use]
    pub fn rcode(&self) -> u8 { u8::try_from(self.flags & RCODE_MASK).unwrap_or(0) }

    /// Raw data of `record`.
    #[must_use]
    pub fn rdata(&self, record: &Resource) -> &[u8] {
        self.pkt.get(record.rdata.clone()).unwrap_or_default()
    }

    /// Decode a name stored anywhere in this message.
    ///
    /// # Errors
    ///
    /// See [`uncompress_name`].
    pub fn name_at(&self, offset: usize) -> Result<String, DnsError> {
        uncompress_name(&self.pkt, offset).map(|(name, _)| name)
    }

    /// First answer of type `rtype` after `prev`, or the first one overall
    /// when `prev` is `None`.
    #[must_use]
    pub fn next_record(&self, rtype: RecordType, prev: Option<&Resource>) -> Option<&Resource> {
        let start = prev
            .and_then(|p| self.answers.iter().position(|a| std::ptr::eq(a, p)))
            .map_or(0, |i| i + 1);
        self.answers.iter().skip(start).find(|a| a.rtype == rtype)
    }

    /// Decode the data of `record` according to its type.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::BadRecordData`] when the data does not fit the
    /// type, or a name error for malformed embedded names.
    pub fn record_data(&self, record: &Resource) -> Result<RecordData, DnsError> {
        let data = self.rdata(record);
        let at = record.rdata.start;
        match record.rtype {
            RecordType::A => <[u8; 4]>::try_from(data)
                .map(|b| RecordData::A(Ipv4Addr::from(b)))
                .map_err(|_| DnsError::BadRecordData(record.rtype)),
            RecordType::AAAA => <[u8; 16]>::try_from(data)
                .map(|b| RecordData::Aaaa(Ipv6Addr::from(b)))
                .map_err(|_| DnsError::BadRecordData(record.rtype)),
            RecordType::CNAME => self.name_at(at).map(RecordData::Cname),
            RecordType::PTR => self.name_at(at).map(RecordData::Ptr),
            RecordType::NS => self.name_at(at).map(RecordData::Ns),
            RecordType::MX => {
                let preference =
                    u16_at(data, 0).ok_or(DnsError::BadRecordData(record.rtype))?;
                let exchange = self.name_at(at + 2)?;
                Ok(RecordData::Mx {
                    preference,
                    exchange,
                })
            }
            _ => Ok(RecordData::Other(self.pkt.slice(record.rdata.clone()))),
        }
    }

    /// Address from the first A or AAAA answer.
    #[must_use]
    pub fn first_address(&self) -> Option<IpAddr> {
        self.answers
            .iter()
            .find_map(|rr| match self.record_data(rr) {
                Ok(RecordData::A(ip)) => Some(IpAddr::V4(ip)),
                Ok(RecordData::Aaaa(ip)) => Some(IpAddr::V6(ip)),
                _ => None,
            })
    }
}

/// Build a recursive query for `name`.
///
/// # Errors
///
/// Returns a [`DnsError`] if `name` cannot be encoded.
///
/// # Examples
///
/// ```
/// use netmux::dns::{RecordType, encode_query};
///
/// let q = encode_query(0x1234, "a.io", RecordType::A).unwrap();
/// assert_eq!(&q[..4], &[0x12, 0x34, 0x01, 0x00]);
/// assert_eq!(&q[12..], &[1, b'a', 2, b'i', b'o', 0, 0, 1, 0, 1]);
/// ```
pub fn encode_query(id: u16, name: &str, rtype: RecordType) -> Result<Vec<u8>, DnsError> {
    let mut out = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    out.extend_from_slice(&write_network_u16(id));
    out.extend_from_slice(&write_network_u16(FLAG_RECURSION_DESIRED));
    out.extend_from_slice(&write_network_u16(1));
    out.extend_from_slice(&[0; 6]);
    encode_name(&mut out, name)?;
    out.extend_from_slice(&write_network_u16(rtype.0));
    out.extend_from_slice(&write_network_u16(CLASS_IN));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use bytes::Bytes;

    use super::{DnsMessage, RecordData, RecordKind, RecordType, encode_query};
    use crate::dns::DnsError;

    /// Response to `example.com A` with one A and one CNAME answer, both
    /// naming the question through a pointer.
    fn response() -> Vec<u8> {
        let mut pkt = encode_query(7, "example.com", RecordType::A).expect("query");
        pkt[2] = 0x81;
        pkt[3] = 0x80;
        pkt[7] = 2;
        pkt.extend_from_slice(&[0xc0, 12, 0, 1, 0, 1, 0, 0, 0x0e, 0x10, 0, 4, 93, 184, 216, 34]);
        pkt.extend_from_slice(&[0xc0, 12, 0, 5, 0, 1, 0, 0, 0, 60, 0, 6, 3, b'w', b'w', b'w', 0xc0, 12]);
        pkt
    }

    fn parse(pkt: Vec<u8>) -> Result<DnsMessage, DnsError> {
        DnsMessage::parse(Bytes::from(pkt), 32, 32)
    }

    #[test]
    fn parses_compressed_answers() {
        let msg = parse(response()).expect("valid response");
        assert_eq!(msg.transaction_id, 7);
        assert!(msg.is_response());
        assert_eq!(msg.questions.len(), 1);
        assert_eq!(msg.questions[0].kind, RecordKind::Question);
        assert_eq!(msg.answers.len(), 2);
        assert_eq!(msg.answers[0].name, "example.com");
        assert_eq!(msg.answers[0].ttl, 3600);
        assert_eq!(
            msg.first_address(),
            Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)))
        );
        assert_eq!(
            msg.record_data(&msg.answers[1]),
            Ok(RecordData::Cname("www.example.com".to_owned()))
        );
    }

    #[test]
    fn next_record_walks_answers_of_one_type() {
        let msg = parse(response()).expect("valid response");
        let first = msg.next_record(RecordType::CNAME, None).expect("cname");
        assert_eq!(first.rtype, RecordType::CNAME);
        assert!(msg.next_record(RecordType::CNAME, Some(first)).is_none());
        assert!(msg.next_record(RecordType::AAAA, None).is_none());
    }

    #[test]
    fn answer_limit_drops_extra_records() {
        let msg = DnsMessage::parse(Bytes::from(response()), 32, 1).expect("valid");
        assert_eq!(msg.answers.len(), 1);
    }

    #[test]
    fn truncated_rdata_is_rejected() {
        let mut pkt = response();
        pkt.truncate(pkt.len() - 3);
        assert_eq!(parse(pkt), Err(DnsError::Truncated));
    }

    #[test]
    fn short_header_is_rejected() {
        assert_eq!(parse(vec![0; 11]), Err(DnsError::Truncated));
    }

    #[test]
    fn record_type_display() {
        assert_eq!(RecordType::AAAA.to_string(), "AAAA");
        assert_eq!(RecordType(99).to_string(), "TYPE99");
    }
}
