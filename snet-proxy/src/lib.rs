//! The upstream dialer registry: one enum covering every way this proxy
//! knows how to reach the outside world.
//!
//! Grounded in `original_source/proxy/proxy.go`, which registers
//! implementations of a shared `Proxy` interface into a runtime
//! `map[string]Proxy`. Per the REDESIGN FLAGS note on replacing
//! interface-based runtime registries with sum types where the variant set
//! is closed and known at compile time, this becomes a plain enum with one
//! `dial` match arm per upstream kind instead of a dynamic-dispatch map.

mod http;
mod socks5;
mod ss;
mod tls;

pub use http::HttpConfig;
pub use socks5::Socks5Config;
pub use ss::SsConfig;
pub use tls::TlsConfig;

use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Any duplex byte stream a dialer can hand back: a plain TCP socket, a
/// TLS stream, or a keystream-wrapped TCP socket.
pub trait DialStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DialStream for T {}
pub type BoxedStream = Box<dyn DialStream>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not resolve an IPv4 address for the upstream tunnel host")]
    ProxyHostLookup,
    #[error("http connect handshake rejected: {0}")]
    HttpHandshakeRejected(String),
    #[error("socks5 handshake failed: {0}")]
    Socks5(String),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("unknown proxy type {0:?}")]
    UnknownType(String),
}

/// Construction parameters for one of the registered dialer kinds.
#[derive(Debug, Clone)]
pub enum ProxyDialerConfig {
    Http(HttpConfig),
    Socks5(Socks5Config),
    Tls(TlsConfig),
    Ss(SsConfig),
}

impl ProxyDialerConfig {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ProxyDialerConfig::Http(_) => "http",
            ProxyDialerConfig::Socks5(_) => "socks5",
            ProxyDialerConfig::Tls(_) => "tls",
            ProxyDialerConfig::Ss(_) => "ss",
        }
    }
}

/// The initialized, ready-to-dial upstream connector.
pub enum ProxyDialer {
    Http(http::HttpDialer),
    Socks5(socks5::Socks5Dialer),
    Tls(tls::TlsDialer),
    Ss(ss::SsDialer),
}

impl ProxyDialer {
    pub async fn init(config: ProxyDialerConfig) -> Result<Self, ProxyError> {
        Ok(match config {
            ProxyDialerConfig::Http(c) => ProxyDialer::Http(http::HttpDialer::new(c)),
            ProxyDialerConfig::Socks5(c) => ProxyDialer::Socks5(socks5::Socks5Dialer::new(c)),
            ProxyDialerConfig::Tls(c) => ProxyDialer::Tls(tls::TlsDialer::new(c).await?),
            ProxyDialerConfig::Ss(c) => ProxyDialer::Ss(ss::SsDialer::new(c)),
        })
    }

    /// The upstream proxy's own resolved IP, used to keep the proxy's
    /// traffic out of the redirect/bypass set.
    pub fn proxy_ip(&self) -> Ipv4Addr {
        match self {
            ProxyDialer::Http(d) => d.proxy_ip(),
            ProxyDialer::Socks5(d) => d.proxy_ip(),
            ProxyDialer::Tls(d) => d.proxy_ip(),
            ProxyDialer::Ss(d) => d.proxy_ip(),
        }
    }

    pub async fn dial(&self, dst_host: &str, dst_port: u16) -> Result<BoxedStream, ProxyError> {
        match self {
            ProxyDialer::Http(d) => d.dial(dst_host, dst_port).await,
            ProxyDialer::Socks5(d) => d.dial(dst_host, dst_port).await,
            ProxyDialer::Tls(d) => d.dial(dst_host, dst_port).await,
            ProxyDialer::Ss(d) => d.dial(dst_host, dst_port).await,
        }
    }
}

/// Looks up a dialer kind by its configured string name. Returns the typed
/// "unknown proxy type" error the registry contract calls for; callers
/// (config loading) supply the matching variant's fields separately.
pub fn known_proxy_kind(name: &str) -> Result<(), ProxyError> {
    match name {
        "http" | "socks5" | "tls" | "ss" | "ss2" => Ok(()),
        other => Err(ProxyError::UnknownType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(known_proxy_kind("wireguard").is_err());
        assert!(known_proxy_kind("socks5").is_ok());
    }
}
