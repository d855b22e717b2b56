//! HTTP CONNECT tunnel dialer.
//!
//! Grounded in `original_source/proxy/http/http.go`: dial the proxy, send a
//! `CONNECT` request with an optional `Proxy-Authorization: Basic` header,
//! and accept any response whose status line starts with "HTTP/1.1 200".

use crate::ProxyError;
use base64::Engine;
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const OK_PREFIX: &str = "HTTP/1.1 200";
const MAX_RESPONSE_LEN: usize = 1024;

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: Ipv4Addr,
    pub port: u16,
    pub auth_user: String,
    pub auth_password: String,
}

pub struct HttpDialer {
    host: Ipv4Addr,
    port: u16,
    auth_header: Option<String>,
}

impl HttpDialer {
    pub fn new(config: HttpConfig) -> Self {
        let auth_header = if config.auth_user.is_empty() {
            None
        } else {
            let creds = format!("{}:{}", config.auth_user, config.auth_password);
            Some(base64::engine::general_purpose::STANDARD.encode(creds))
        };

        Self {
            host: config.host,
            port: config.port,
            auth_header,
        }
    }

    pub fn proxy_ip(&self) -> Ipv4Addr {
        self.host
    }

    pub async fn dial(&self, dst_host: &str, dst_port: u16) -> Result<crate::BoxedStream, ProxyError> {
        let mut conn = TcpStream::connect((self.host, self.port)).await?;

        let mut handshake = format!("CONNECT {dst_host}:{dst_port} HTTP/1.1\r\n");
        if let Some(auth) = &self.auth_header {
            handshake.push_str(&format!("Proxy-Authorization: Basic {auth}\r\n"));
        }
        handshake.push_str("\r\n");

        conn.write_all(handshake.as_bytes()).await?;

        let mut buf = vec![0u8; MAX_RESPONSE_LEN];
        let n = conn.read(&mut buf).await?;
        let resp = String::from_utf8_lossy(&buf[..n]);

        if !resp.starts_with(OK_PREFIX) {
            return Err(ProxyError::HttpHandshakeRejected(resp.into_owned()));
        }

        Ok(Box::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn sends_connect_request_and_accepts_200() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(conn);
            let mut request_line = String::new();
            reader.read_line(&mut request_line).await.unwrap();
            assert_eq!(request_line, "CONNECT example.com:443 HTTP/1.1\r\n");

            let mut line = String::new();
            loop {
                line.clear();
                reader.read_line(&mut line).await.unwrap();
                if line == "\r\n" {
                    break;
                }
            }
            reader.into_inner().write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await.unwrap();
        });

        let dialer = HttpDialer::new(HttpConfig {
            host: match addr.ip() {
                std::net::IpAddr::V4(v4) => v4,
                _ => unreachable!(),
            },
            port: addr.port(),
            auth_user: String::new(),
            auth_password: String::new(),
        });

        dialer.dial("example.com", 443).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn includes_basic_auth_header_when_configured() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(conn);
            let mut saw_auth = false;
            let mut line = String::new();
            loop {
                line.clear();
                reader.read_line(&mut line).await.unwrap();
                if line == "\r\n" {
                    break;
                }
                if line.starts_with("Proxy-Authorization: Basic ") {
                    saw_auth = true;
                }
            }
            assert!(saw_auth);
            reader.into_inner().write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        });

        let dialer = HttpDialer::new(HttpConfig {
            host: match addr.ip() {
                std::net::IpAddr::V4(v4) => v4,
                _ => unreachable!(),
            },
            port: addr.port(),
            auth_user: "alice".to_string(),
            auth_password: "hunter2".to_string(),
        });

        dialer.dial("example.com", 443).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_non_200_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = conn.read(&mut buf).await;
            conn.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await.unwrap();
        });

        let dialer = HttpDialer::new(HttpConfig {
            host: match addr.ip() {
                std::net::IpAddr::V4(v4) => v4,
                _ => unreachable!(),
            },
            port: addr.port(),
            auth_user: String::new(),
            auth_password: String::new(),
        });

        let err = dialer.dial("example.com", 443).await.unwrap_err();
        assert!(matches!(err, ProxyError::HttpHandshakeRejected(_)));
    }
}
