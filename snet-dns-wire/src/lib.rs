//! Wire-format parsing and construction for the narrow slice of DNS this
//! proxy needs: single-question messages and A-record-only answers.
//!
//! Grounded in `original_source/dns/msg.go`. The label-walk in that file's
//! question parser has an off-by-one (`body[offset+1] == 0x0` where it
//! should read `body[offset] == 0x0`) that only happens to work because
//! every QTYPE this project cares about has a zero high byte. This module
//! implements the standard, unconditionally correct length-prefixed-label
//! walk instead of carrying the bug forward.

use std::net::Ipv4Addr;
use thiserror::Error;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_NS: u16 = 2;
pub const QTYPE_CNAME: u16 = 5;
pub const QTYPE_SOA: u16 = 6;
pub const QTYPE_PTR: u16 = 12;
pub const QTYPE_MX: u16 = 15;
pub const QTYPE_TXT: u16 = 16;
pub const QTYPE_AAAA: u16 = 28;
pub const QTYPE_SRV: u16 = 33;
pub const QCLASS_IN: u16 = 1;

const HEADER_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnsWireError {
    #[error("message too short to contain a header ({0} bytes)")]
    TooShort(usize),
    #[error("message has no question section")]
    EmptyBody,
    #[error("multiple questions in a single message are not supported (qdcount={0})")]
    MultipleQuestions(u16),
    #[error("question section truncated while parsing labels")]
    TruncatedQuestion,
    #[error("answer section truncated or malformed")]
    BadAnswer,
    #[error("reserved label length bits encountered (0x80/0x40)")]
    ReservedLabelBits,
}

/// Returns the conventional mnemonic for a query type, or `None` for types
/// this codec has no name table entry for.
pub fn qtype_name(qtype: u16) -> Option<&'static str> {
    Some(match qtype {
        QTYPE_A => "A",
        QTYPE_NS => "NS",
        QTYPE_CNAME => "CNAME",
        QTYPE_SOA => "SOA",
        QTYPE_PTR => "PTR",
        QTYPE_MX => "MX",
        QTYPE_TXT => "TXT",
        QTYPE_AAAA => "AAAA",
        QTYPE_SRV => "SRV",
        _ => return None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ARecord {
    pub ip: Ipv4Addr,
    pub ttl: u32,
}

/// A parsed DNS message: header fields, the single question, and any A
/// records carried in the answer section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub id: u16,
    pub is_response: bool,
    pub qd_count: u16,
    pub an_count: u16,
    pub qdomain: String,
    pub qtype: u16,
    pub qclass: u16,
    pub answers: Vec<ARecord>,
}

impl DnsMessage {
    pub fn is_query(&self) -> bool {
        !self.is_response
    }

    /// `"<name>:<numeric type>"`, used as the cache key.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.qdomain, self.qtype)
    }
}

/// Parse a wire datagram into a [`DnsMessage`].
pub fn parse(data: &[u8]) -> Result<DnsMessage, DnsWireError> {
    if data.len() < HEADER_LEN {
        return Err(DnsWireError::TooShort(data.len()));
    }

    let id = u16::from_be_bytes([data[0], data[1]]);
    let is_response = data[2] & 0x80 != 0;
    let qd_count = u16::from_be_bytes([data[4], data[5]]);
    let an_count = u16::from_be_bytes([data[6], data[7]]);

    if qd_count > 1 {
        return Err(DnsWireError::MultipleQuestions(qd_count));
    }

    let body = &data[HEADER_LEN..];
    if body.is_empty() {
        return Err(DnsWireError::EmptyBody);
    }

    let (labels, mut cursor) = read_labels(body)?;
    let qdomain = labels.join(".");

    if cursor + 4 > body.len() {
        return Err(DnsWireError::TruncatedQuestion);
    }
    let qtype = u16::from_be_bytes([body[cursor], body[cursor + 1]]);
    cursor += 2;
    let qclass = u16::from_be_bytes([body[cursor], body[cursor + 1]]);
    cursor += 2;

    let mut answers = Vec::new();
    if is_response {
        let mut rest = &body[cursor..];
        for _ in 0..an_count {
            if rest.is_empty() {
                break;
            }
            match parse_answer(rest)? {
                Some((record, consumed)) => {
                    if let Some(a) = record {
                        answers.push(a);
                    }
                    rest = &rest[consumed..];
                }
                None => break,
            }
        }
    }

    Ok(DnsMessage {
        id,
        is_response,
        qd_count,
        an_count,
        qdomain,
        qtype,
        qclass,
        answers,
    })
}

/// Reads length-prefixed labels until the terminating zero-length byte.
/// Returns the labels and the cursor position just past the terminator.
fn read_labels(body: &[u8]) -> Result<(Vec<String>, usize), DnsWireError> {
    let mut labels = Vec::new();
    let mut cursor = 0;

    loop {
        let len_byte = *body.get(cursor).ok_or(DnsWireError::TruncatedQuestion)?;
        if len_byte & 0xC0 != 0 {
            return Err(DnsWireError::ReservedLabelBits);
        }
        cursor += 1;
        if len_byte == 0 {
            break;
        }

        let label_len = len_byte as usize;
        let label_bytes = body
            .get(cursor..cursor + label_len)
            .ok_or(DnsWireError::TruncatedQuestion)?;
        labels.push(String::from_utf8_lossy(label_bytes).into_owned());
        cursor += label_len;
    }

    Ok((labels, cursor))
}

/// Parses one answer record's name field, fixed fields, and (if type A)
/// RDATA. Returns `Some((record, bytes_consumed))` on success, `None` if
/// `rest` is too short to contain even the fixed fields (caller should
/// stop iterating rather than error — truncated trailing records are
/// tolerated).
fn parse_answer(rest: &[u8]) -> Result<Option<(Option<ARecord>, usize)>, DnsWireError> {
    let mut cursor = 0;

    match rest[0] & 0xC0 {
        0x00 => loop {
            let b = *rest.get(cursor).ok_or(DnsWireError::BadAnswer)?;
            if b & 0xC0 == 0xC0 {
                cursor += 2;
                break;
            }
            cursor += 1;
            if b == 0x00 {
                break;
            }
            cursor += b as usize;
        },
        0xC0 => cursor += 2,
        _ => return Err(DnsWireError::ReservedLabelBits),
    }

    if cursor + 10 > rest.len() {
        return Ok(None);
    }

    let atype = u16::from_be_bytes([rest[cursor], rest[cursor + 1]]);
    cursor += 4; // type(2) + class(2)
    let ttl = u32::from_be_bytes([
        rest[cursor],
        rest[cursor + 1],
        rest[cursor + 2],
        rest[cursor + 3],
    ]);
    cursor += 4;
    let rdlen = u16::from_be_bytes([rest[cursor], rest[cursor + 1]]) as usize;
    cursor += 2;

    if cursor + rdlen > rest.len() {
        return Ok(None);
    }

    if atype != QTYPE_A {
        return Ok(Some((None, cursor + rdlen)));
    }

    if rdlen != 4 {
        return Ok(Some((None, cursor + rdlen)));
    }

    let rdata = &rest[cursor..cursor + rdlen];
    let ip = Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]);

    Ok(Some((Some(ARecord { ip, ttl }), cursor + rdlen)))
}

fn encode_domain(qdomain: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(qdomain.len() + 2);
    for label in qdomain.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0x00);
    out
}

/// Builds a recursive query for `(qdomain, qtype)` with a fixed
/// transaction id matching the reference implementation's test fixtures.
pub fn build_query(id: u16, qdomain: &str, qtype: u16) -> Vec<u8> {
    let mut data = Vec::with_capacity(32);
    data.extend_from_slice(&id.to_be_bytes());
    data.extend_from_slice(&[0x01, 0x00]); // flags: recursion desired
    data.extend_from_slice(&[0x00, 0x01]); // qdcount = 1
    data.extend_from_slice(&[0x00, 0x00]); // ancount
    data.extend_from_slice(&[0x00, 0x00]); // nscount
    data.extend_from_slice(&[0x00, 0x00]); // arcount
    data.extend_from_slice(&encode_domain(qdomain));
    data.extend_from_slice(&qtype.to_be_bytes());
    data.extend_from_slice(&QCLASS_IN.to_be_bytes());
    data
}

/// Echoes a query datagram back with the response bit set and zero
/// answers — used for disabled-qtype and similar short-circuit replies.
pub fn build_empty_response(query: &[u8]) -> Vec<u8> {
    let mut resp = query.to_vec();
    if resp.len() > 3 {
        resp[2] = 0x81;
        resp[3] = 0x80;
    }
    resp
}

/// Builds a response carrying a single synthetic A answer pointing back
/// at the question name via the `0xC00C` compression pointer, TTL 100.
pub fn build_single_a_response(query: &[u8], qdomain: &str, ip: Ipv4Addr) -> Vec<u8> {
    let label_len = encode_domain(qdomain).len();
    let answer_offset = HEADER_LEN + label_len + 4;

    let mut resp = vec![0u8; answer_offset + 16];
    let copy_len = query.len().min(answer_offset);
    resp[..copy_len].copy_from_slice(&query[..copy_len]);

    resp[2] = 0x81;
    resp[3] = 0x80;
    resp[7] = 0x01; // ancount = 1
    resp[9] = 0x00;
    resp[11] = 0x00;

    resp[answer_offset] = 0xC0;
    resp[answer_offset + 1] = 0x0C;
    resp[answer_offset + 3] = 0x01; // type A
    resp[answer_offset + 5] = 0x01; // class IN
    resp[answer_offset + 9] = 100; // ttl, low byte of a 4-byte field: 0x00000064
    resp[answer_offset + 11] = 0x04; // rdlen = 4

    let octets = ip.octets();
    resp[answer_offset + 12..answer_offset + 16].copy_from_slice(&octets);

    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_query_fixture() -> Vec<u8> {
        build_query(0x2501, "baidu.com", QTYPE_A)
    }

    #[test]
    fn builds_expected_query_bytes() {
        let q = encode_query_fixture();

        assert_eq!(&q[0..2], &[0x25, 0x01]);
        assert_eq!(&q[2..4], &[0x01, 0x00]);
        assert_eq!(&q[4..6], &[0x00, 0x01]);

        let parsed = parse(&q).unwrap();
        assert_eq!(parsed.qdomain, "baidu.com");
        assert_eq!(parsed.qtype, QTYPE_A);
        assert!(parsed.is_query());
    }

    #[test]
    fn rejects_too_short() {
        assert_eq!(parse(&[0u8; 4]), Err(DnsWireError::TooShort(4)));
    }

    #[test]
    fn rejects_multiple_questions() {
        let mut q = encode_query_fixture();
        q[5] = 0x02;
        assert_eq!(parse(&q), Err(DnsWireError::MultipleQuestions(2)));
    }

    #[test]
    fn round_trips_single_a_response() {
        let query = encode_query_fixture();
        let ip: Ipv4Addr = "180.101.50.188".parse().unwrap();
        let resp = build_single_a_response(&query, "baidu.com", ip);

        let parsed = parse(&resp).unwrap();
        assert!(parsed.is_response);
        assert_eq!(parsed.an_count, 1);
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].ip, ip);
        assert_eq!(parsed.answers[0].ttl, 100);
        assert_eq!(parsed.cache_key(), format!("baidu.com:{QTYPE_A}"));
    }

    #[test]
    fn empty_response_sets_response_bit_and_keeps_question() {
        let query = encode_query_fixture();
        let resp = build_empty_response(&query);

        let parsed = parse(&resp).unwrap();
        assert!(parsed.is_response);
        assert_eq!(parsed.qdomain, "baidu.com");
        assert_eq!(parsed.answers.len(), 0);
    }

    #[test]
    fn skips_non_a_records_and_keeps_later_a_records() {
        // Build a response with a CNAME-shaped filler answer followed by an A
        // answer, both using the compressed-pointer name form.
        let query = encode_query_fixture();
        let mut resp = query.clone();
        resp[2] = 0x81;
        resp[3] = 0x80;
        resp[7] = 0x02; // ancount = 2

        // CNAME answer: pointer, type=5 (CNAME), class=1, ttl=60, rdlen=2, rdata=2 bytes
        resp.extend_from_slice(&[0xC0, 0x0C]);
        resp.extend_from_slice(&5u16.to_be_bytes());
        resp.extend_from_slice(&QCLASS_IN.to_be_bytes());
        resp.extend_from_slice(&60u32.to_be_bytes());
        resp.extend_from_slice(&2u16.to_be_bytes());
        resp.extend_from_slice(&[0xC0, 0x0C]);

        // A answer
        resp.extend_from_slice(&[0xC0, 0x0C]);
        resp.extend_from_slice(&QTYPE_A.to_be_bytes());
        resp.extend_from_slice(&QCLASS_IN.to_be_bytes());
        resp.extend_from_slice(&120u32.to_be_bytes());
        resp.extend_from_slice(&4u16.to_be_bytes());
        resp.extend_from_slice(&[1, 2, 3, 4]);

        let parsed = parse(&resp).unwrap();
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].ip, Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(parsed.answers[0].ttl, 120);
    }

    #[test]
    fn tolerates_uncompressed_answer_name_with_embedded_pointer() {
        let query = encode_query_fixture();
        let mut resp = query.clone();
        resp[2] = 0x81;
        resp[3] = 0x80;
        resp[7] = 0x01;

        // Uncompressed label "x" followed by a mid-chain pointer instead of
        // a zero terminator - tolerated per the lenient parsing rule.
        resp.push(1);
        resp.push(b'x');
        resp.extend_from_slice(&[0xC0, 0x0C]);

        resp.extend_from_slice(&QTYPE_A.to_be_bytes());
        resp.extend_from_slice(&QCLASS_IN.to_be_bytes());
        resp.extend_from_slice(&300u32.to_be_bytes());
        resp.extend_from_slice(&4u16.to_be_bytes());
        resp.extend_from_slice(&[8, 8, 8, 8]);

        let parsed = parse(&resp).unwrap();
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].ip, Ipv4Addr::new(8, 8, 8, 8));
    }

    #[test]
    fn qtype_name_table_covers_common_types() {
        assert_eq!(qtype_name(QTYPE_A), Some("A"));
        assert_eq!(qtype_name(QTYPE_AAAA), Some("AAAA"));
        assert_eq!(qtype_name(9999), None);
    }
}
