//! Best-effort server-name extraction from the first bytes of a new
//! connection, for observability only.
//!
//! Grounded in `original_source/sniffer/{sniffer,tls,http}.go`. Both
//! parsers here operate on an already-read buffer rather than owning a
//! `Read` themselves — the bidirectional pipe (component H) is the one
//! holding the connection, so sniffing is just a pure function over the
//! first chunk it already read.

use thiserror::Error;

const TLS_RECORD_TYPE_HANDSHAKE: u8 = 22;
const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_HEADER_LEN: usize = 5 + 38;
const HTTP_MIN_FIRST_LINE_LEN: usize = 14; // "GET / HTTP/1.1"

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniffError {
    #[error("not a TLS ClientHello record")]
    NotClientHello,
    #[error("buffer truncated before expected field")]
    Truncated,
    #[error("no SNI extension found in ClientHello")]
    NoSniExtension,
    #[error("buffer too short to be an HTTP request")]
    TooShort,
    #[error("no Host header found")]
    NoHostHeader,
}

/// Extracts the `server_name` extension value from a TLS ClientHello
/// record. Expects `data` to be the first bytes read off a fresh
/// connection.
pub fn parse_tls_sni(data: &[u8]) -> Result<String, SniffError> {
    let byte_at = |i: usize| -> Result<u8, SniffError> { data.get(i).copied().ok_or(SniffError::Truncated) };

    if byte_at(0)? != TLS_RECORD_TYPE_HANDSHAKE || byte_at(5)? != TLS_HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(SniffError::NotClientHello);
    }

    let mut index = HANDSHAKE_HEADER_LEN;

    let session_id_len = byte_at(index)? as usize;
    index += 1 + session_id_len;

    let cipher_suites_len = (byte_at(index)? as usize) << 8 | byte_at(index + 1)? as usize;
    index += 2 + cipher_suites_len;

    let compression_methods_len = byte_at(index)? as usize;
    index += 1 + compression_methods_len;

    if index + 2 > data.len() {
        return Err(SniffError::Truncated);
    }
    let ext_len = (data[index] as usize) << 8 | data[index + 1] as usize;
    index += 2;

    if index + ext_len > data.len() {
        return Err(SniffError::Truncated);
    }
    let ext_block = &data[index..index + ext_len];

    parse_sni_extension(ext_block)
}

fn parse_sni_extension(ext_block: &[u8]) -> Result<String, SniffError> {
    let mut index = 0;

    while index + 1 < ext_block.len() {
        let ext_type = (ext_block[index] as u16) << 8 | ext_block[index + 1] as u16;

        if ext_type == 0x0000 {
            // server_name extension
            let mut cursor = index + 2;
            cursor += 2; // this extension's length field
            cursor += 3; // server name list length(2) + server name type(1)

            if cursor + 2 > ext_block.len() {
                return Err(SniffError::Truncated);
            }
            let sn_len = (ext_block[cursor] as usize) << 8 | ext_block[cursor + 1] as usize;
            cursor += 2;

            let name = ext_block
                .get(cursor..cursor + sn_len)
                .ok_or(SniffError::Truncated)?;
            return Ok(String::from_utf8_lossy(name).into_owned());
        }

        let this_ext_len = *ext_block.get(index + 2).ok_or(SniffError::Truncated)? as usize * 256
            + *ext_block.get(index + 3).ok_or(SniffError::Truncated)? as usize;
        index += 4 + this_ext_len;
    }

    Err(SniffError::NoSniExtension)
}

/// Extracts the value of a `Host` header from the first bytes of an HTTP
/// request. Requires the header line to contain exactly one `:` — a Host
/// value that itself embeds a colon (e.g. an explicit port) is treated as
/// not found, matching the reference implementation.
pub fn parse_http_host(data: &[u8]) -> Result<String, SniffError> {
    if data.len() < HTTP_MIN_FIRST_LINE_LEN + 2 {
        return Err(SniffError::TooShort);
    }

    let text = String::from_utf8_lossy(data);
    for line in text.split("\r\n") {
        if line.len() < 6 {
            continue;
        }
        let lower = line.to_lowercase();
        let parts: Vec<&str> = lower.split(':').collect();
        if parts.len() != 2 {
            continue;
        }
        if parts[0].trim() != "host" {
            continue;
        }
        return Ok(parts[1].trim().to_string());
    }

    Err(SniffError::NoHostHeader)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_client_hello(sni: &str) -> Vec<u8> {
        let name_len = sni.len();
        let server_name_list_length = 3 + name_len; // type(1) + len(2) + name
        let ext_data_len = 2 + server_name_list_length; // list length field + list content

        let mut ext = vec![0x00, 0x00]; // server_name extension type
        ext.extend_from_slice(&(ext_data_len as u16).to_be_bytes());
        ext.extend_from_slice(&(server_name_list_length as u16).to_be_bytes());
        ext.push(0x00); // server name type: host_name
        ext.extend_from_slice(&(name_len as u16).to_be_bytes());
        ext.extend_from_slice(sni.as_bytes());

        let mut msg = vec![22u8, 0x03, 0x03, 0x00, 0x00, 1u8];
        msg.extend_from_slice(&[0u8; 3 + 2 + 32]); // handshake length(3) + client version(2) + random(32)
        msg.push(0x00); // session id len
        msg.extend_from_slice(&[0x00, 0x02]); // cipher suites len
        msg.extend_from_slice(&[0x00, 0x00]); // one cipher suite
        msg.push(0x01); // compression methods len
        msg.push(0x00); // one compression method
        msg.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        msg.extend_from_slice(&ext);
        msg
    }

    #[test]
    fn extracts_sni_from_client_hello() {
        let hello = build_client_hello("example.com");
        assert_eq!(parse_tls_sni(&hello).unwrap(), "example.com");
    }

    #[test]
    fn rejects_non_handshake_records() {
        let data = vec![23u8; 64]; // application data, not handshake
        assert_eq!(parse_tls_sni(&data), Err(SniffError::NotClientHello));
    }

    #[test]
    fn truncated_hello_is_an_error() {
        assert_eq!(parse_tls_sni(&[22, 3, 3, 0, 0]), Err(SniffError::Truncated));
    }

    #[test]
    fn extracts_host_header() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\nUser-Agent: x\r\n\r\n";
        assert_eq!(parse_http_host(req).unwrap(), "example.com");
    }

    #[test]
    fn rejects_host_value_with_embedded_colon() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        assert_eq!(parse_http_host(req), Err(SniffError::NoHostHeader));
    }

    #[test]
    fn rejects_requests_without_host_header() {
        let req = b"GET / HTTP/1.1\r\nUser-Agent: x\r\n\r\n";
        assert_eq!(parse_http_host(req), Err(SniffError::NoHostHeader));
    }

    #[test]
    fn too_short_buffer_is_rejected() {
        assert_eq!(parse_http_host(b"short"), Err(SniffError::TooShort));
    }
}
