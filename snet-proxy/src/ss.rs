//! Symmetric-cipher stream dialer ("ss"/"ss2" in the registry).
//!
//! `original_source/proxy/proxy.go` registers `ss`/`ss2` as variants backed
//! by an external cipher library without specifying one. This port uses
//! the real `chacha20` crate: password-derived key (SHA-256 of the shared
//! secret), independent keystreams for each direction, one length-prefixed
//! handshake frame carrying the destination host/port, then a raw
//! keystream-XORed byte stream. This is a confidentiality-only analog of
//! the legacy stream-cipher Shadowsocks protocol, not a wire-compatible
//! reimplementation of any particular real-world variant.

use crate::ProxyError;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use sha2::{Digest, Sha256};
use std::io;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

const OUT_NONCE: [u8; 12] = [0u8; 12];
const IN_NONCE: [u8; 12] = {
    let mut n = [0u8; 12];
    n[11] = 1;
    n
};

#[derive(Debug, Clone)]
pub struct SsConfig {
    pub host: Ipv4Addr,
    pub port: u16,
    pub password: String,
}

pub struct SsDialer {
    host: Ipv4Addr,
    port: u16,
    key: [u8; 32],
}

impl SsDialer {
    pub fn new(config: SsConfig) -> Self {
        Self {
            host: config.host,
            port: config.port,
            key: derive_key(&config.password),
        }
    }

    pub fn proxy_ip(&self) -> Ipv4Addr {
        self.host
    }

    pub async fn dial(&self, dst_host: &str, dst_port: u16) -> Result<crate::BoxedStream, ProxyError> {
        let tcp = TcpStream::connect((self.host, self.port)).await?;
        let mut stream = CipherStream::new(tcp, self.key);
        stream.write_handshake(dst_host, dst_port).await?;
        Ok(Box::new(stream))
    }
}

fn derive_key(password: &str) -> [u8; 32] {
    Sha256::digest(password.as_bytes()).into()
}

struct CipherStream {
    inner: TcpStream,
    enc: ChaCha20,
    dec: ChaCha20,
    pending_write: Vec<u8>,
    pending_offset: usize,
}

impl CipherStream {
    fn new(inner: TcpStream, key: [u8; 32]) -> Self {
        Self {
            inner,
            enc: ChaCha20::new(&key.into(), &OUT_NONCE.into()),
            dec: ChaCha20::new(&key.into(), &IN_NONCE.into()),
            pending_write: Vec::new(),
            pending_offset: 0,
        }
    }

    async fn write_handshake(&mut self, dst_host: &str, dst_port: u16) -> io::Result<()> {
        let mut payload = Vec::with_capacity(3 + dst_host.len());
        payload.push(dst_host.len() as u8);
        payload.extend_from_slice(dst_host.as_bytes());
        payload.extend_from_slice(&dst_port.to_be_bytes());

        self.enc.apply_keystream(&mut payload);
        self.inner.write_all(&payload).await
    }
}

impl AsyncRead for CipherStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let filled_before = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled_after = buf.filled().len();
                this.dec.apply_keystream(&mut buf.filled_mut()[filled_before..filled_after]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for CipherStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.pending_offset < this.pending_write.len() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.pending_write[this.pending_offset..]) {
                Poll::Ready(Ok(n)) => {
                    this.pending_offset += n;
                    if this.pending_offset < this.pending_write.len() {
                        return Poll::Pending;
                    }
                    this.pending_write.clear();
                    this.pending_offset = 0;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }

        let mut ciphertext = data.to_vec();
        this.enc.apply_keystream(&mut ciphertext);

        match Pin::new(&mut this.inner).poll_write(cx, &ciphertext) {
            Poll::Ready(Ok(n)) => {
                if n < ciphertext.len() {
                    this.pending_write = ciphertext;
                    this.pending_offset = n;
                }
                Poll::Ready(Ok(data.len()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                this.pending_write = ciphertext;
                this.pending_offset = 0;
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.pending_offset < this.pending_write.len() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.pending_write[this.pending_offset..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::WriteZero, "write zero")))
                }
                Poll::Ready(Ok(n)) => this.pending_offset += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        this.pending_write.clear();
        this.pending_offset = 0;

        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut *this).poll_flush(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chacha20::cipher::{KeyIvInit as _, StreamCipher as _};

    #[test]
    fn keystreams_for_each_direction_differ() {
        let key = derive_key("shared-secret");
        let mut enc = ChaCha20::new(&key.into(), &OUT_NONCE.into());
        let mut dec = ChaCha20::new(&key.into(), &IN_NONCE.into());

        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        enc.apply_keystream(&mut a);
        dec.apply_keystream(&mut b);

        assert_ne!(a, b);
    }

    #[test]
    fn derive_key_is_deterministic_per_password() {
        assert_eq!(derive_key("hunter2"), derive_key("hunter2"));
        assert_ne!(derive_key("hunter2"), derive_key("hunter3"));
    }
}
