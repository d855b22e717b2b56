//! The bidirectional byte-copy engine shared by the TCP redirector and the
//! upstream TLS tunnel server.
//!
//! Grounded in `original_source/redirector/redirector.go`'s per-connection
//! handling: two symmetric copy directions ("toRemote", "toLocal"), each
//! refreshing a combined read/write deadline on every iteration and exiting
//! on EOF, a write error, an unrecoverable read error, or context
//! cancellation. Per the REDESIGN FLAGS note on channel fan-in for stats,
//! sample delivery here goes through [`snet_stats::StatsHandle`], which is
//! itself lossy.

use snet_stats::{Direction, StatsHandle};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const COPY_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("toRemote copy failed: {0}")]
    ToRemote(#[source] io::Error),
    #[error("toLocal copy failed: {0}")]
    ToLocal(#[source] io::Error),
}

/// What the pipe extracted from the client's first bytes, if sniffing was
/// enabled and parsing succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sniffed {
    pub server_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct PipeOptions {
    pub stats: Option<(StatsHandle, String, u16)>,
    pub sniff: bool,
}

/// Splices `client` and `remote` together until one side closes, an
/// unrecoverable error occurs, `token` is cancelled, or `idle_timeout`
/// elapses with no traffic in either direction on a given copy loop's
/// current iteration.
///
/// Idle-timeout errors are swallowed (expected on half-idle flows); other
/// I/O errors are returned. The first non-idle-timeout error from either
/// direction wins if both occur.
pub async fn run<A, B>(
    client: A,
    remote: B,
    token: CancellationToken,
    idle_timeout: Duration,
    opts: PipeOptions,
) -> (Option<Sniffed>, Option<PipeError>)
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_r, client_w) = tokio::io::split(client);
    let (remote_r, remote_w) = tokio::io::split(remote);

    let PipeOptions { stats, sniff } = opts;

    let to_remote_stats = stats.clone();
    let to_remote_token = token.clone();
    let to_remote = tokio::spawn(async move {
        copy_loop(
            client_r,
            remote_w,
            to_remote_token,
            idle_timeout,
            to_remote_stats,
            Direction::Tx,
            sniff,
        )
        .await
    });

    let to_local_stats = stats.clone();
    let to_local_token = token.clone();
    let to_local = tokio::spawn(async move {
        copy_loop(remote_r, client_w, to_local_token, idle_timeout, to_local_stats, Direction::Rx, false)
            .await
            .1
    });

    let to_remote_result = to_remote.await;
    let to_local_result = to_local.await;
    token.cancel();

    let (sniffed, remote_err) = match to_remote_result {
        Ok((sniffed, err)) => (sniffed, err.map(PipeError::ToRemote)),
        Err(e) => {
            debug!(error = %e, "toRemote task panicked");
            (None, None)
        }
    };
    let local_err = match to_local_result {
        Ok(err) => err.map(PipeError::ToLocal),
        Err(e) => {
            debug!(error = %e, "toLocal task panicked");
            None
        }
    };

    (sniffed, remote_err.or(local_err))
}

/// One direction of the splice. Returns any sniffed server name (only
/// meaningful when `sniff` is set) and the first unrecoverable I/O error,
/// if any.
async fn copy_loop<R, W>(
    mut reader: R,
    mut writer: W,
    token: CancellationToken,
    idle_timeout: Duration,
    stats: Option<(StatsHandle, String, u16)>,
    direction: Direction,
    sniff: bool,
) -> (Option<Sniffed>, Option<io::Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut sniffed = None;
    let mut first_read = true;

    loop {
        if token.is_cancelled() {
            return (sniffed, None);
        }

        let n = tokio::select! {
            () = token.cancelled() => return (sniffed, None),
            res = tokio::time::timeout(idle_timeout, reader.read(&mut buf)) => match res {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return (sniffed, Some(e)),
                Err(_elapsed) => {
                    trace!("pipe direction idle timeout, closing");
                    return (sniffed, None);
                }
            },
        };

        if n == 0 {
            return (sniffed, None);
        }

        if first_read {
            first_read = false;
            if sniff {
                sniffed = sniff_first_chunk(&buf[..n]);
            }
        }

        if let Some((handle, host, port)) = &stats {
            handle.record(host, *port, direction, n as u64);
        }

        let write_res = tokio::select! {
            () = token.cancelled() => return (sniffed, None),
            res = tokio::time::timeout(idle_timeout, writer.write_all(&buf[..n])) => res,
        };

        match write_res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return (sniffed, Some(e)),
            Err(_elapsed) => {
                trace!("pipe direction idle timeout on write, closing");
                return (sniffed, None);
            }
        }
    }
}

fn sniff_first_chunk(chunk: &[u8]) -> Option<Sniffed> {
    if let Ok(name) = snet_sniff::parse_tls_sni(chunk) {
        return Some(Sniffed { server_name: name });
    }
    if let Ok(name) = snet_sniff::parse_http_host(chunk) {
        return Some(Sniffed { server_name: name });
    }
    None
}
