//! Building DNS responses for server connections.

use super::{
    DnsError,
    message::{
        CLASS_IN,
        DnsMessage,
        FLAG_RECURSION_AVAILABLE,
        FLAG_RESPONSE,
        HEADER_LEN,
        RecordType,
        Resource,
    },
    name::NameCompressor,
};
use crate::{
    byte_order::{u16_at, write_network_u16, write_network_u32},
    connection::Connection,
};

/// TTL used by [`DnsReply::add_answer`] when the caller does not pick one.
pub const DEFAULT_TTL: u32 = 3600;
const RCODE_FORMAT_ERROR: u16 = 1;

/// Response under construction.
///
/// The header and question section are copied from the query; answers are
/// appended with shared name compression.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use netmux::dns::{DnsMessage, DnsReply, RecordType, encode_query};
///
/// let query = encode_query(9, "host.lan", RecordType::A).unwrap();
/// let query = DnsMessage::parse(Bytes::from(query), 8, 8).unwrap();
/// let mut reply = DnsReply::new(&query).unwrap();
/// reply.add_answer(&query.questions[0], &[10, 0, 0, 2]).unwrap();
/// let parsed = DnsMessage::parse(Bytes::from(reply.finish()), 8, 8).unwrap();
/// assert_eq!(parsed.answers.len(), 1);
/// assert_eq!(parsed.first_address(), Some([10, 0, 0, 2].into()));
/// ```
#[derive(Debug)]
pub struct DnsReply {
    buf: Vec<u8>,
    compressor: NameCompressor,
    answers: u16,
}

impl DnsReply {
    /// Start a response to `query`.
    ///
    /// # Errors
    ///
    /// Returns a [`DnsError`] if a question name cannot be re-encoded.
    pub fn new(query: &DnsMessage) -> Result<Self, DnsError> {
        let mut reply = Self {
            buf: Vec::with_capacity(512),
            compressor: NameCompressor::new(),
            answers: 0,
        };
        let flags = query.flags | FLAG_RESPONSE | FLAG_RECURSION_AVAILABLE;
        let questions = u16::try_from(query.questions.len()).map_err(|_| DnsError::TooManyRecords)?;
        reply.buf.extend_from_slice(&write_network_u16(query.transaction_id));
        reply.buf.extend_from_slice(&write_network_u16(flags));
        reply.buf.extend_from_slice(&write_network_u16(questions));
        reply.buf.extend_from_slice(&[0; 6]);
        for q in &query.questions {
            reply.compressor.write(&mut reply.buf, &q.name)?;
            reply.buf.extend_from_slice(&write_network_u16(q.rtype.0));
            reply.buf.extend_from_slice(&write_network_u16(q.rclass));
        }
        Ok(reply)
    }

    /// Answer `question` with raw record data and [`DEFAULT_TTL`].
    ///
    /// # Errors
    ///
    /// See [`DnsReply::add_record`].
    pub fn add_answer(&mut self, question: &Resource, rdata: &[u8]) -> Result<(), DnsError> {
        self.add_record(&question.name, question.rtype, DEFAULT_TTL, rdata)
    }

    /// Append an `IN` answer with raw record data.
    ///
    /// # Errors
    ///
    /// Returns a [`DnsError`] for unencodable names, data over 65535 bytes
    /// or more than 65535 answers.
    pub fn add_record(
        &mut self,
        name: &str,
        rtype: RecordType,
        ttl: u32,
        rdata: &[u8],
    ) -> Result<(), DnsError> {
        let len = u16::try_from(rdata.len()).map_err(|_| DnsError::BadRecordData(rtype))?;
        self.record_head(name, rtype, ttl)?;
        self.buf.extend_from_slice(&write_network_u16(len));
        self.buf.extend_from_slice(rdata);
        Ok(())
    }

    /// Append a record whose data is a domain name, such as CNAME or PTR.
    ///
    /// # Errors
    ///
    /// As for [`DnsReply::add_record`].
    pub fn add_name_record(
        &mut self,
        name: &str,
        rtype: RecordType,
        ttl: u32,
        target: &str,
    ) -> Result<(), DnsError> {
        self.record_head(name, rtype, ttl)?;
        let len_at = self.buf.len();
        self.buf.extend_from_slice(&[0, 0]);
        self.compressor.write(&mut self.buf, target)?;
        let len = u16::try_from(self.buf.len() - len_at - 2).map_err(|_| DnsError::NameTooLong)?;
        self.buf[len_at..len_at + 2].copy_from_slice(&write_network_u16(len));
        Ok(())
    }

    fn record_head(&mut self, name: &str, rtype: RecordType, ttl: u32) -> Result<(), DnsError> {
        self.answers = self.answers.checked_add(1).ok_or(DnsError::TooManyRecords)?;
        self.compressor.write(&mut self.buf, name)?;
        self.buf.extend_from_slice(&write_network_u16(rtype.0));
        self.buf.extend_from_slice(&write_network_u16(CLASS_IN));
        self.buf.extend_from_slice(&write_network_u32(ttl));
        Ok(())
    }

    /// Number of answers added so far.
    #[must_use]
    pub fn answer_count(&self) -> u16 { self.answers }

    /// Wire bytes of the finished response.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        self.buf[6..8].copy_from_slice(&write_network_u16(self.answers));
        self.buf
    }
}

/// FORMERR response echoing the transaction id of a rejected packet.
#[must_use]
pub fn format_error_reply(pkt: &[u8]) -> Vec<u8> {
    let mut out = vec![0; HEADER_LEN];
    let id = u16_at(pkt, 0).unwrap_or(0);
    out[..2].copy_from_slice(&write_network_u16(id));
    out[2..4].copy_from_slice(&write_network_u16(FLAG_RESPONSE | RCODE_FORMAT_ERROR));
    out
}

impl Connection {
    /// Queue a finished response.
    ///
    /// Stream connections prefix the message with its two-byte length.
    pub fn send_dns_reply(&mut self, reply: DnsReply) { self.send_dns_packet(&reply.finish()); }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{DEFAULT_TTL, DnsReply, format_error_reply};
    use crate::dns::{DnsMessage, RecordData, RecordType, encode_query};

    fn query(name: &str, rtype: RecordType) -> DnsMessage {
        let pkt = encode_query(0x4242, name, rtype).expect("query");
        DnsMessage::parse(Bytes::from(pkt), 8, 8).expect("parse query")
    }

    #[test]
    fn reply_copies_header_and_question() {
        let q = query("svc.local", RecordType::A);
        let mut reply = DnsReply::new(&q).expect("reply");
        reply.add_answer(&q.questions[0], &[127, 0, 0, 1]).expect("answer");
        let msg = DnsMessage::parse(Bytes::from(reply.finish()), 8, 8).expect("parse");
        assert_eq!(msg.transaction_id, 0x4242);
        assert!(msg.is_response());
        assert_eq!(msg.flags & 0x0100, 0x0100);
        assert_eq!(msg.questions[0].name, "svc.local");
        assert_eq!(msg.answers[0].ttl, DEFAULT_TTL);
    }

    #[test]
    fn answer_names_point_at_the_question() {
        let q = query("svc.local", RecordType::A);
        let mut reply = DnsReply::new(&q).expect("reply");
        reply.add_answer(&q.questions[0], &[127, 0, 0, 1]).expect("answer");
        let wire = reply.finish();
        let answer_at = 12 + 11 + 4;
        assert_eq!(&wire[answer_at..answer_at + 2], &[0xc0, 12]);
    }

    #[test]
    fn name_records_are_compressed() {
        let q = query("www.example.org", RecordType::CNAME);
        let mut reply = DnsReply::new(&q).expect("reply");
        reply
            .add_name_record("www.example.org", RecordType::CNAME, 60, "cdn.example.org")
            .expect("cname");
        let msg = DnsMessage::parse(Bytes::from(reply.finish()), 8, 8).expect("parse");
        assert_eq!(msg.rdata(&msg.answers[0]).len(), 6);
        assert_eq!(
            msg.record_data(&msg.answers[0]),
            Ok(RecordData::Cname("cdn.example.org".to_owned()))
        );
    }

    #[test]
    fn format_error_keeps_transaction_id() {
        assert_eq!(
            format_error_reply(&[0xab, 0xcd, 0xff]),
            [0xab, 0xcd, 0x80, 0x01, 0, 0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(&format_error_reply(&[])[..2], &[0, 0]);
    }
}
