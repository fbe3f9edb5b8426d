//! DNS wire format codec (RFC 1035).
//!
//! Encodes single-question queries and decodes answers into a normalized
//! [`Outcome`]. Decoding never panics: every malformed input is reported
//! as [`Outcome::DecodeError`] so that only the affected query is aborted.
//!
//! TCP transports frame each message with a 2-byte big-endian length
//! prefix, see [`frame_tcp`] and [`TcpFrameBuffer`].

use crate::base::neterror::NetError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const HEADER_LEN: usize = 12;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_HOPS: usize = 32;

const CLASS_IN: u16 = 1;
const FLAG_QR: u16 = 0x8000;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const RCODE_MASK: u16 = 0x000F;
const RCODE_NXDOMAIN: u8 = 3;

/// Record types the resolver asks for or understands in answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Cname,
    Aaaa,
    Srv,
}

impl RecordType {
    pub fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Cname => 5,
            RecordType::Aaaa => 28,
            RecordType::Srv => 33,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(RecordType::A),
            5 => Some(RecordType::Cname),
            28 => Some(RecordType::Aaaa),
            33 => Some(RecordType::Srv),
            _ => None,
        }
    }

    /// Mnemonic used in DoH `type=` parameters and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Cname => "CNAME",
            RecordType::Aaaa => "AAAA",
            RecordType::Srv => "SRV",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a decoded answer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    /// A or AAAA record.
    Address(IpAddr),
    /// CNAME record pointing at another name.
    Alias(String),
}

/// One decoded answer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub ttl: u32,
    pub data: RecordData,
}

impl Record {
    pub fn address(&self) -> Option<IpAddr> {
        match &self.data {
            RecordData::Address(ip) => Some(*ip),
            RecordData::Alias(_) => None,
        }
    }

    pub fn alias(&self) -> Option<&str> {
        match &self.data {
            RecordData::Alias(target) => Some(target),
            RecordData::Address(_) => None,
        }
    }
}

/// The question section echoed back by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
}

impl Question {
    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_code(self.qtype)
    }
}

/// Normalized result of decoding a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Successful answer. An empty list means the name exists but has no
    /// records of the requested type.
    Ok(Vec<Record>),
    /// NXDOMAIN.
    NoDomain,
    /// TC bit set; the query must be retried over TCP.
    Truncated,
    /// Any other non-zero response code.
    ServerError(u8),
    /// Malformed or unparseable message.
    DecodeError(String),
}

/// A decoded response: transaction id, first question and outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: Option<u16>,
    pub question: Option<Question>,
    pub outcome: Outcome,
}

/// Encodes a recursive query with a single question.
///
/// A trailing dot marks an absolute name and encodes identically to the
/// relative form.
pub fn encode_query(hostname: &str, record_type: RecordType, id: u16) -> Result<Bytes, NetError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + hostname.len() + 6);
    buf.put_u16(id);
    buf.put_u16(FLAG_RD);
    buf.put_u16(1); // QDCOUNT
    buf.put_u16(0); // ANCOUNT
    buf.put_u16(0); // NSCOUNT
    buf.put_u16(0); // ARCOUNT
    put_name(&mut buf, hostname)?;
    buf.put_u16(record_type.code());
    buf.put_u16(CLASS_IN);
    Ok(buf.freeze())
}

fn put_name(buf: &mut BytesMut, hostname: &str) -> Result<(), NetError> {
    let name = hostname.strip_suffix('.').unwrap_or(hostname);
    if name.is_empty() {
        return Err(NetError::not_resolved(hostname, "empty hostname"));
    }

    let mut encoded_len = 1;
    for label in name.split('.') {
        if label.is_empty() {
            return Err(NetError::not_resolved(hostname, "empty label in hostname"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(NetError::not_resolved(hostname, "label longer than 63 bytes"));
        }
        encoded_len += label.len() + 1;
        if encoded_len > MAX_NAME_LEN {
            return Err(NetError::not_resolved(hostname, "hostname longer than 255 bytes"));
        }
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    Ok(())
}

/// Decodes a response into its [`Outcome`].
pub fn decode_answer(message: &[u8]) -> Outcome {
    decode_response(message).outcome
}

/// Decodes a response, keeping the transaction id and question so the
/// caller can match it against the query in flight.
pub fn decode_response(message: &[u8]) -> Response {
    let mut reader = Reader::new(message);
    let id = reader.u16().ok();

    let mut response = Response {
        id,
        question: None,
        outcome: Outcome::Ok(Vec::new()),
    };
    match decode_sections(&mut reader, &mut response) {
        Ok(outcome) => response.outcome = outcome,
        Err(reason) => response.outcome = Outcome::DecodeError(reason.to_string()),
    }
    response
}

fn decode_sections(reader: &mut Reader<'_>, response: &mut Response) -> Result<Outcome, &'static str> {
    let flags = reader.u16().map_err(|_| "message shorter than header")?;
    let qdcount = reader.u16().map_err(|_| "message shorter than header")?;
    let ancount = reader.u16().map_err(|_| "message shorter than header")?;
    // NSCOUNT and ARCOUNT are not needed for address resolution.
    reader.skip(4).map_err(|_| "message shorter than header")?;

    if flags & FLAG_QR == 0 {
        return Err("message is not a response");
    }

    for index in 0..qdcount {
        let name = reader.name()?;
        let qtype = reader.u16()?;
        let _qclass = reader.u16()?;
        if index == 0 {
            response.question = Some(Question { name, qtype });
        }
    }

    if flags & FLAG_TC != 0 {
        return Ok(Outcome::Truncated);
    }
    match (flags & RCODE_MASK) as u8 {
        0 => {}
        RCODE_NXDOMAIN => return Ok(Outcome::NoDomain),
        rcode => return Ok(Outcome::ServerError(rcode)),
    }

    let mut records = Vec::with_capacity(ancount as usize);
    for _ in 0..ancount {
        let name = reader.name()?;
        let rtype = reader.u16()?;
        let _class = reader.u16()?;
        let ttl = reader.u32()?;
        let rdlength = reader.u16()? as usize;
        let rdata_start = reader.pos;
        let rdata = reader.take(rdlength)?;

        let data = match RecordType::from_code(rtype) {
            Some(RecordType::A) => {
                let octets: [u8; 4] = rdata.try_into().map_err(|_| "A record with bad length")?;
                RecordData::Address(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            Some(RecordType::Aaaa) => {
                let octets: [u8; 16] =
                    rdata.try_into().map_err(|_| "AAAA record with bad length")?;
                RecordData::Address(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            Some(RecordType::Cname) => {
                let mut target = Reader::at(reader.buf, rdata_start);
                RecordData::Alias(target.name()?)
            }
            // SRV and anything else carry nothing the resolver needs.
            _ => continue,
        };
        // A negative TTL (high bit set) is treated as zero per RFC 2181.
        let ttl = if ttl > i32::MAX as u32 { 0 } else { ttl };
        records.push(Record { name, ttl, data });
    }
    Ok(Outcome::Ok(records))
}

/// Bounds-checked cursor over a message.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], &'static str> {
        let end = self.pos.checked_add(n).ok_or("length overflow")?;
        let slice = self.buf.get(self.pos..end).ok_or("unexpected end of message")?;
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), &'static str> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, &'static str> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, &'static str> {
        let mut bytes = self.take(2)?;
        Ok(bytes.get_u16())
    }

    fn u32(&mut self) -> Result<u32, &'static str> {
        let mut bytes = self.take(4)?;
        Ok(bytes.get_u32())
    }

    /// Reads a possibly compressed name, leaving the cursor after it.
    fn name(&mut self) -> Result<String, &'static str> {
        let mut labels: Vec<String> = Vec::new();
        let mut encoded_len = 1;
        let mut hops = 0;
        let mut cursor = Reader::at(self.buf, self.pos);
        let mut resume: Option<usize> = None;

        loop {
            let len = cursor.u8()?;
            match len & 0xC0 {
                0x00 => {}
                0xC0 => {
                    let low = cursor.u8()?;
                    hops += 1;
                    if hops > MAX_POINTER_HOPS {
                        return Err("compression pointer loop");
                    }
                    resume.get_or_insert(cursor.pos);
                    cursor.pos = (((len & 0x3F) as usize) << 8) | low as usize;
                    continue;
                }
                _ => return Err("unsupported label type"),
            }
            if len == 0 {
                break;
            }
            let label = cursor.take(len as usize)?;
            encoded_len += label.len() + 1;
            if encoded_len > MAX_NAME_LEN {
                return Err("name longer than 255 bytes");
            }
            labels.push(String::from_utf8_lossy(label).into_owned());
        }

        self.pos = resume.unwrap_or(cursor.pos);
        Ok(labels.join("."))
    }
}

/// Prefixes a message with its 2-byte length for TCP transports.
pub fn frame_tcp(message: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(message.len() + 2);
    buf.put_u16(message.len() as u16);
    buf.put_slice(message);
    buf.freeze()
}

/// Reassembles length-prefixed messages from a TCP byte stream.
///
/// A message is only handed out once its declared length has been fully
/// received.
#[derive(Debug, Default)]
pub struct TcpFrameBuffer {
    buf: BytesMut,
}

impl TcpFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < len + 2 {
            return None;
        }
        self.buf.advance(2);
        Some(self.buf.split_to(len).freeze())
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ResponseBuilder;
    use super::*;

    #[test]
    fn test_encode_query_layout() {
        let query = encode_query("example.com", RecordType::A, 0xBEEF).unwrap();

        assert_eq!(&query[..2], &[0xBE, 0xEF]);
        // RD set, opcode QUERY
        assert_eq!(&query[2..4], &[0x01, 0x00]);
        // one question, no other sections
        assert_eq!(&query[4..12], &[0, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&query[12..25], b"\x07example\x03com\x00");
        assert_eq!(&query[25..], &[0, 1, 0, 1]);
    }

    #[test]
    fn test_encode_absolute_name_matches_relative() {
        let relative = encode_query("example.com", RecordType::Aaaa, 7).unwrap();
        let absolute = encode_query("example.com.", RecordType::Aaaa, 7).unwrap();
        assert_eq!(relative, absolute);
    }

    #[test]
    fn test_encode_rejects_bad_names() {
        assert!(encode_query("", RecordType::A, 1).is_err());
        assert!(encode_query("a..b", RecordType::A, 1).is_err());
        let long_label = "a".repeat(64);
        assert!(encode_query(&long_label, RecordType::A, 1).is_err());
        let long_name = vec!["abcdefghij"; 30].join(".");
        assert!(encode_query(&long_name, RecordType::A, 1).is_err());
    }

    #[test]
    fn test_round_trip_recovers_question() {
        let query = encode_query("www.example.org", RecordType::Aaaa, 42).unwrap();
        let reply = ResponseBuilder::reply_to(&query).build();

        let response = decode_response(&reply);
        assert_eq!(response.id, Some(42));
        let question = response.question.unwrap();
        assert_eq!(question.name, "www.example.org");
        assert_eq!(question.record_type(), Some(RecordType::Aaaa));
        assert_eq!(response.outcome, Outcome::Ok(vec![]));
    }

    #[test]
    fn test_decode_addresses_and_alias() {
        let reply = ResponseBuilder::new(1)
            .question("www.example.com", RecordType::A)
            .alias("www.example.com", 300, "cdn.example.net")
            .address("cdn.example.net", 60, "93.184.216.34")
            .build();

        match decode_answer(&reply) {
            Outcome::Ok(records) => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[0].alias(), Some("cdn.example.net"));
                assert_eq!(records[1].name, "cdn.example.net");
                assert_eq!(records[1].ttl, 60);
                assert_eq!(records[1].address(), Some("93.184.216.34".parse().unwrap()));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_decode_classifies_failures() {
        let nxdomain = ResponseBuilder::new(1)
            .question("nope.example", RecordType::A)
            .rcode(3)
            .build();
        assert_eq!(decode_answer(&nxdomain), Outcome::NoDomain);

        let servfail = ResponseBuilder::new(1)
            .question("x.example", RecordType::A)
            .rcode(2)
            .build();
        assert_eq!(decode_answer(&servfail), Outcome::ServerError(2));

        let truncated = ResponseBuilder::new(1)
            .question("big.example", RecordType::A)
            .truncated()
            .build();
        let response = decode_response(&truncated);
        assert_eq!(response.outcome, Outcome::Truncated);
        assert_eq!(response.question.unwrap().name, "big.example");
    }

    #[test]
    fn test_empty_answer_is_not_nxdomain() {
        let reply = ResponseBuilder::new(9)
            .question("v4only.example", RecordType::Aaaa)
            .build();
        assert_eq!(decode_answer(&reply), Outcome::Ok(vec![]));
    }

    #[test]
    fn test_decode_compressed_names() {
        // Question "a.example", answer name is a pointer to offset 12
        let mut msg = vec![0, 5, 0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0];
        msg.extend_from_slice(b"\x01a\x07example\x00\x00\x01\x00\x01");
        msg.extend_from_slice(&[0xC0, 12, 0, 1, 0, 1, 0, 0, 0, 30, 0, 4, 10, 0, 0, 1]);

        match decode_answer(&msg) {
            Outcome::Ok(records) => {
                assert_eq!(records[0].name, "a.example");
                assert_eq!(records[0].address(), Some("10.0.0.1".parse().unwrap()));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_decode_never_panics_on_garbage() {
        assert!(matches!(decode_answer(&[]), Outcome::DecodeError(_)));
        assert!(matches!(decode_answer(&[0, 1, 0x81]), Outcome::DecodeError(_)));

        // Pointer to itself
        let mut looped = vec![0, 5, 0x81, 0x80, 0, 1, 0, 0, 0, 0, 0, 0];
        looped.extend_from_slice(&[0xC0, 12, 0, 1, 0, 1]);
        assert!(matches!(decode_answer(&looped), Outcome::DecodeError(_)));

        // Answer count larger than the message
        let short = vec![0, 5, 0x81, 0x80, 0, 0, 0, 3, 0, 0, 0, 0];
        assert!(matches!(decode_answer(&short), Outcome::DecodeError(_)));

        // A query is not a response
        let query = encode_query("example.com", RecordType::A, 1).unwrap();
        assert!(matches!(decode_answer(&query), Outcome::DecodeError(_)));
    }

    #[test]
    fn test_decode_rejects_bad_address_length() {
        let mut msg = vec![0, 5, 0x81, 0x80, 0, 0, 0, 1, 0, 0, 0, 0];
        msg.extend_from_slice(b"\x01a\x00\x00\x01\x00\x01\x00\x00\x00\x1e\x00\x03\x01\x02\x03");
        assert!(matches!(decode_answer(&msg), Outcome::DecodeError(_)));
    }

    #[test]
    fn test_tcp_frame_buffer_waits_for_full_message() {
        let framed = frame_tcp(b"hello");
        let mut buffer = TcpFrameBuffer::new();

        buffer.push(&framed[..1]);
        assert!(buffer.next_frame().is_none());
        buffer.push(&framed[1..4]);
        assert!(buffer.next_frame().is_none());
        buffer.push(&framed[4..]);
        assert_eq!(buffer.next_frame().unwrap(), Bytes::from_static(b"hello"));
        assert!(buffer.is_empty());
    }
}
