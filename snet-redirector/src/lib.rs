//! The TCP redirector (component G): accepts OS-redirected connections,
//! recovers the original destination, dials the configured upstream
//! proxy, and splices the two sockets together.
//!
//! Grounded in `original_source/redirector/redirector.go`'s accept loop shape —
//! bind, loop accepting connections, hand each one to an independent
//! goroutine that recovers the destination, dials, and pipes — translated
//! to a `tokio::spawn`-per-connection task per the REDESIGN FLAGS note.

mod original_dst;

pub use original_dst::OriginalDst;

use snet_pipe::PipeOptions;
use snet_proxy::ProxyDialer;
use snet_stats::StatsHandle;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RedirectorError {
    #[error("failed to bind redirector listener: {0}")]
    Bind(#[source] io::Error),
    #[error("accept loop error: {0}")]
    Accept(#[source] io::Error),
}

pub struct RedirectorConfig {
    pub listen_addr: SocketAddr,
    pub proxy_timeout: Duration,
    pub enable_sniff: bool,
    pub stats: Option<StatsHandle>,
}

impl Default for RedirectorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:1111".parse().unwrap(),
            proxy_timeout: DEFAULT_PROXY_TIMEOUT,
            enable_sniff: false,
            stats: None,
        }
    }
}

pub struct TcpRedirector {
    listener: TcpListener,
    dialer: Arc<ProxyDialer>,
    config: RedirectorConfig,
    shutdown: CancellationToken,
}

impl TcpRedirector {
    pub async fn new(config: RedirectorConfig, dialer: ProxyDialer) -> Result<Self, RedirectorError> {
        let listener = TcpListener::bind(config.listen_addr).await.map_err(RedirectorError::Bind)?;

        Ok(Self {
            listener,
            dialer: Arc::new(dialer),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn run(&self) -> Result<(), RedirectorError> {
        info!(addr = %self.config.listen_addr, "tcp redirector listening");

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("tcp redirector shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.map_err(RedirectorError::Accept)?;

                    let dialer = Arc::clone(&self.dialer);
                    let proxy_timeout = self.config.proxy_timeout;
                    let enable_sniff = self.config.enable_sniff;
                    let stats = self.config.stats.clone();
                    let child_token = self.shutdown.child_token();

                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, dialer, proxy_timeout, enable_sniff, stats, child_token).await
                        {
                            debug!(error = %e, %peer, "redirected connection ended with an error");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    dialer: Arc<ProxyDialer>,
    proxy_timeout: Duration,
    enable_sniff: bool,
    stats: Option<StatsHandle>,
    token: CancellationToken,
) -> io::Result<()> {
    let original = stream
        .original_dst()
        .map_err(|e| io::Error::new(e.kind(), format!("failed to recover original destination: {e}")))?;

    let dst_host = original.ip().to_string();
    let dst_port = original.port();

    let remote = dialer
        .dial(&dst_host, dst_port)
        .await
        .map_err(|e| io::Error::other(format!("dial failed for {dst_host}:{dst_port}: {e}")))?;

    let opts = PipeOptions {
        stats: stats.map(|s| (s, dst_host, dst_port)),
        sniff: enable_sniff,
    };

    let (sniffed, err) = snet_pipe::run(stream, remote, token, proxy_timeout, opts).await;

    if let Some(sniffed) = sniffed {
        debug!(server_name = %sniffed.server_name, "sniffed server name");
    }

    match err {
        Some(e) => Err(io::Error::other(e)),
        None => Ok(()),
    }
}
