//! RFC 1928 SOCKS5 dialer with optional RFC 1929 username/password auth.
//!
//! Grounded in `original_source/proxy/socks5/socks5.go`, which delegates the
//! handshake to `golang.org/x/net/proxy`. This port hand-rolls the
//! handshake instead of reaching for an external SOCKS crate, since the
//! protocol is small and fully specified.

use crate::ProxyError;
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone)]
pub struct Socks5Config {
    pub host: Ipv4Addr,
    pub port: u16,
    pub auth_user: String,
    pub auth_password: String,
}

pub struct Socks5Dialer {
    host: Ipv4Addr,
    port: u16,
    auth: Option<(String, String)>,
}

impl Socks5Dialer {
    pub fn new(config: Socks5Config) -> Self {
        let auth = if config.auth_user.is_empty() {
            None
        } else {
            Some((config.auth_user, config.auth_password))
        };

        Self {
            host: config.host,
            port: config.port,
            auth,
        }
    }

    pub fn proxy_ip(&self) -> Ipv4Addr {
        self.host
    }

    pub async fn dial(&self, dst_host: &str, dst_port: u16) -> Result<crate::BoxedStream, ProxyError> {
        let mut conn = TcpStream::connect((self.host, self.port)).await?;

        self.greet(&mut conn).await?;
        self.connect_request(&mut conn, dst_host, dst_port).await?;

        Ok(Box::new(conn))
    }

    async fn greet(&self, conn: &mut TcpStream) -> Result<(), ProxyError> {
        let methods: &[u8] = if self.auth.is_some() {
            &[METHOD_NO_AUTH, METHOD_USER_PASS]
        } else {
            &[METHOD_NO_AUTH]
        };

        let mut greeting = Vec::with_capacity(2 + methods.len());
        greeting.push(VERSION);
        greeting.push(methods.len() as u8);
        greeting.extend_from_slice(methods);
        conn.write_all(&greeting).await?;

        let mut reply = [0u8; 2];
        conn.read_exact(&mut reply).await?;

        match reply[1] {
            METHOD_NO_AUTH => Ok(()),
            METHOD_USER_PASS => self.authenticate(conn).await,
            METHOD_NO_ACCEPTABLE => Err(ProxyError::Socks5("no acceptable auth method".into())),
            other => Err(ProxyError::Socks5(format!("unexpected auth method {other}"))),
        }
    }

    async fn authenticate(&self, conn: &mut TcpStream) -> Result<(), ProxyError> {
        let (user, pass) = self
            .auth
            .as_ref()
            .ok_or_else(|| ProxyError::Socks5("server requested auth but none configured".into()))?;

        let mut req = Vec::with_capacity(3 + user.len() + pass.len());
        req.push(0x01);
        req.push(user.len() as u8);
        req.extend_from_slice(user.as_bytes());
        req.push(pass.len() as u8);
        req.extend_from_slice(pass.as_bytes());
        conn.write_all(&req).await?;

        let mut reply = [0u8; 2];
        conn.read_exact(&mut reply).await?;
        if reply[1] != 0x00 {
            return Err(ProxyError::Socks5("username/password authentication rejected".into()));
        }

        Ok(())
    }

    async fn connect_request(
        &self,
        conn: &mut TcpStream,
        dst_host: &str,
        dst_port: u16,
    ) -> Result<(), ProxyError> {
        let mut req = vec![VERSION, CMD_CONNECT, 0x00];

        if let Ok(ipv4) = dst_host.parse::<Ipv4Addr>() {
            req.push(ATYP_IPV4);
            req.extend_from_slice(&ipv4.octets());
        } else {
            req.push(ATYP_DOMAIN);
            req.push(dst_host.len() as u8);
            req.extend_from_slice(dst_host.as_bytes());
        }
        req.extend_from_slice(&dst_port.to_be_bytes());

        conn.write_all(&req).await?;

        let mut head = [0u8; 4];
        conn.read_exact(&mut head).await?;
        if head[1] != 0x00 {
            return Err(ProxyError::Socks5(format!("connect request rejected, code {}", head[1])));
        }

        let addr_len = match head[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => {
                let mut len_byte = [0u8; 1];
                conn.read_exact(&mut len_byte).await?;
                len_byte[0] as usize
            }
            other => return Err(ProxyError::Socks5(format!("unsupported bound address type {other}"))),
        };

        let mut discard = vec![0u8; addr_len + 2]; // bound address + port
        conn.read_exact(&mut discard).await?;

        Ok(())
    }
}
