//! Client side of the upstream TLS tunnel protocol (component I).
//!
//! Grounded in `original_source/proxy/tls/tls.go` for the dial-then-splice
//! shape, and `original_source/upstream_server.go` for the token the server
//! side expects. The original Go client never sent a token (only host and
//! port); this port adds it, since the server it talks to authenticates
//! every connection by token and a client that omits one can never
//! establish a tunnel.
//!
//! Certificate verification is intentionally disabled: small deployments
//! of this tunnel use a self-signed keypair with no distributing CA, so
//! the only meaningful trust anchor is the shared token.

use crate::ProxyError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub host: String,
    pub port: u16,
    pub token: String,
}

pub struct TlsDialer {
    resolved_ip: Ipv4Addr,
    host: String,
    port: u16,
    token: String,
    connector: TlsConnector,
}

impl TlsDialer {
    pub async fn new(config: TlsConfig) -> Result<Self, ProxyError> {
        let resolved_ip = resolve_ipv4(&config.host, config.port).await?;

        let tls_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();

        Ok(Self {
            resolved_ip,
            host: config.host,
            port: config.port,
            token: config.token,
            connector: TlsConnector::from(Arc::new(tls_config)),
        })
    }

    pub fn proxy_ip(&self) -> Ipv4Addr {
        self.resolved_ip
    }

    pub async fn dial(&self, dst_host: &str, dst_port: u16) -> Result<crate::BoxedStream, ProxyError> {
        let tcp = TcpStream::connect((self.resolved_ip, self.port)).await?;

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|_| ProxyError::Tls(rustls::Error::General("invalid tunnel server name".into())))?;

        let mut stream = BufStream::new(self.connector.connect(server_name, tcp).await?);

        write_framed(&mut stream, self.token.as_bytes()).await?;
        write_framed(&mut stream, dst_host.as_bytes()).await?;
        stream.write_all(&dst_port.to_be_bytes()).await?;
        stream.flush().await?;

        Ok(Box::new(stream))
    }
}

async fn write_framed<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> std::io::Result<()> {
    w.write_all(&(data.len() as u16).to_be_bytes()).await?;
    w.write_all(data).await
}

async fn resolve_ipv4(host: &str, port: u16) -> Result<Ipv4Addr, ProxyError> {
    use tokio::net::lookup_host;

    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    lookup_host((host, port))
        .await?
        .find_map(|addr| match addr.ip() {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        })
        .ok_or(ProxyError::ProxyHostLookup)
}

#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}
