//! Server side of the upstream TLS tunnel protocol (component I): a
//! token-authenticated, length-prefixed framing that turns a TLS
//! connection into a raw splice to a freshly-dialed `tcp://host:port`.
//!
//! Grounded in `original_source/upstream_server.go`: accept a TLS
//! connection, read the length-prefixed token and reject on mismatch,
//! then read the length-prefixed host and the 2-byte port, dial the
//! target, and splice with a 30-second idle timeout. The client side of
//! this protocol lives in `snet-proxy`'s `tls` dialer.

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use snet_pipe::PipeOptions;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TOKEN_LEN: u16 = 4096;
const MAX_HOST_LEN: u16 = 255;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("frame length {0} exceeds the maximum of {1}")]
    FrameTooLarge(u16, u16),
    #[error("token mismatch")]
    TokenMismatch,
    #[error("host name was not valid utf-8")]
    InvalidHost,
}

/// Construction parameters for [`TunnelServer`].
pub struct TunnelServerConfig {
    pub listen_addr: SocketAddr,
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
    pub token: String,
}

pub struct TunnelServer {
    listen_addr: SocketAddr,
    acceptor: TlsAcceptor,
    token: String,
    shutdown: CancellationToken,
}

impl TunnelServer {
    pub fn new(config: TunnelServerConfig) -> Result<Self, TunnelError> {
        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(config.cert_chain, config.private_key)?;

        Ok(Self {
            listen_addr: config.listen_addr,
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            token: config.token,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn run(&self) -> Result<(), TunnelError> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!(addr = %self.listen_addr, "upstream tunnel server listening");

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("upstream tunnel server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let acceptor = self.acceptor.clone();
                    let token = self.token.clone();
                    let child_token = self.shutdown.child_token();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, acceptor, &token, child_token).await {
                            warn!(error = %e, %peer, "upstream tunnel connection failed");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    expected_token: &str,
    token: CancellationToken,
) -> Result<(), TunnelError> {
    let mut tls = acceptor.accept(stream).await?;

    let got_token = read_framed_string(&mut tls, MAX_TOKEN_LEN).await?;
    if got_token != expected_token {
        return Err(TunnelError::TokenMismatch);
    }

    let dst_host = read_framed_string(&mut tls, MAX_HOST_LEN).await?;
    let mut port_buf = [0u8; 2];
    tls.read_exact(&mut port_buf).await?;
    let dst_port = u16::from_be_bytes(port_buf);

    debug!(dst_host, dst_port, "upstream tunnel authenticated, dialing target");

    let remote = TcpStream::connect((dst_host.as_str(), dst_port)).await?;

    let (_sniffed, err) = snet_pipe::run(tls, remote, token, IDLE_TIMEOUT, PipeOptions::default()).await;
    if let Some(e) = err {
        return Err(TunnelError::Io(io::Error::other(e)));
    }

    Ok(())
}

async fn read_framed_string<S: tokio::io::AsyncRead + Unpin>(
    stream: &mut S,
    max_len: u16,
) -> Result<String, TunnelError> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf);

    if len > max_len {
        return Err(TunnelError::FrameTooLarge(len, max_len));
    }

    let mut data = vec![0u8; len as usize];
    stream.read_exact(&mut data).await?;

    String::from_utf8(data).map_err(|_| TunnelError::InvalidHost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::generate_simple_self_signed;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{PrivatePkcs8KeyDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
    use tokio::net::TcpListener as TokioTcpListener;
    use tokio_rustls::TlsConnector;

    #[derive(Debug)]
    struct AcceptAnyCert;

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _e: &CertificateDer<'_>,
            _i: &[CertificateDer<'_>],
            _s: &ServerName<'_>,
            _o: &[u8],
            _n: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _m: &[u8],
            _c: &CertificateDer<'_>,
            _d: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _m: &[u8],
            _c: &CertificateDer<'_>,
            _d: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![SignatureScheme::ED25519, SignatureScheme::ECDSA_NISTP256_SHA256]
        }
    }

    #[tokio::test]
    async fn rejects_wrong_token() {
        let cert = generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = CertificateDer::from(cert.cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.signing_key.serialize_der()));

        let server = TunnelServer::new(TunnelServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            cert_chain: vec![cert_der],
            private_key: key_der,
            token: "correct-token".to_string(),
        })
        .unwrap();

        // Bind manually so we can learn the ephemeral port before `run` takes ownership of it.
        let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let server = TunnelServer {
            listen_addr: addr,
            ..server
        };

        let shutdown = server.shutdown.clone();
        let run_handle = tokio::spawn(async move { server.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;

        let client_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));

        let tcp = TcpStream::connect(addr).await.unwrap();
        let server_name = ServerName::try_from("localhost").unwrap();
        let mut tls = connector.connect(server_name, tcp).await.unwrap();

        let bad_token = b"wrong-token";
        tls.write_all(&(bad_token.len() as u16).to_be_bytes()).await.unwrap();
        tls.write_all(bad_token).await.unwrap();
        tls.flush().await.unwrap();

        let mut buf = [0u8; 1];
        let n = tls.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "server should close the connection on token mismatch");

        shutdown.cancel();
        let _ = run_handle.await;
    }
}
