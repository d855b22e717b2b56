//! The split-horizon DNS server: answers locally where policy allows,
//! otherwise races a domestic UDP resolver against a foreign resolver
//! reached through the upstream proxy and picks a response by classifying
//! the domestic answer's first A record.
//!
//! Grounded in `original_source/dns/server.go`. The goroutine-per-field
//! mutable-capture pattern there (`go func(data []byte) { cnData, err =
//! ... }`) becomes two `tokio::spawn`ed futures whose results are
//! `.await`ed explicitly, per the REDESIGN FLAGS note on avoiding shared
//! mutable captures across tasks.

mod domain_match;

pub use domain_match::domain_match;

use snet_bloom::BloomFilter;
use snet_chnroute::ChnRouteTrie;
use snet_dns_wire::{ARecord, DnsMessage, DnsWireError};
use snet_ttl_cache::TtlCache;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const DNS_PORT: u16 = 53;
const DNS_TIMEOUT: Duration = Duration::from_secs(5);
const CACHE_SIZE: usize = 5000;
const DEFAULT_TTL_SECS: u32 = 300;
const BLOCKLIST_BLOOM_ERROR_RATE: f64 = 0.00001;
const BLOCKED_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const UDP_RECV_BUF: usize = 1024;

#[derive(Debug, Error)]
pub enum DnsSplitterError {
    #[error("failed to read block host file: {0}")]
    BlockHostFile(#[source] io::Error),
    #[error("invalid block host bloom filter parameters: {0}")]
    Bloom(#[from] snet_bloom::BloomFilterError),
    #[error("invalid chnroute CIDR: {0}")]
    ChnRoute(#[from] snet_chnroute::CidrError),
    #[error("invalid cache capacity: {0}")]
    Cache(#[from] snet_ttl_cache::CacheError),
}

#[derive(Debug, Error)]
enum QueryError {
    #[error("i/o error talking to upstream resolver: {0}")]
    Io(#[from] io::Error),
    #[error("upstream resolver did not answer within the deadline")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessReason {
    Mapped,
    Disabled,
    Blocked,
    Cached,
    CnNoCache,
    FqNoCache,
}

impl AccessReason {
    fn as_str(self) -> &'static str {
        match self {
            AccessReason::Mapped => "mapped",
            AccessReason::Disabled => "disabled",
            AccessReason::Blocked => "blocked",
            AccessReason::Cached => "cached",
            AccessReason::CnNoCache => "cn-nocache",
            AccessReason::FqNoCache => "fq-nocache",
        }
    }
}

/// Construction parameters for [`DnsSplitter`]. The block-host file, if
/// given, is read during [`DnsSplitter::new`]; lines are expected one
/// pattern/host per line, blank lines and lines starting with `#` are
/// skipped.
pub struct DnsSplitterConfig {
    pub listen_addr: SocketAddr,
    pub cn_dns: Ipv4Addr,
    pub fq_dns: Ipv4Addr,
    pub enable_cache: bool,
    pub enforce_ttl: u32,
    pub disable_qtypes: Vec<String>,
    pub force_fq: Vec<String>,
    pub host_map: HashMap<String, Ipv4Addr>,
    pub block_host_file: Option<std::path::PathBuf>,
    pub additional_block_hosts: Vec<String>,
    pub chnroutes: Vec<String>,
    pub prefetch: Option<PrefetchConfig>,
}

#[derive(Debug, Clone, Copy)]
pub struct PrefetchConfig {
    pub interval: Duration,
    pub count: usize,
}

pub struct DnsSplitter {
    listen_addr: SocketAddr,
    cn_dns: SocketAddr,
    fq_dns: SocketAddr,
    enforce_ttl: u32,
    disable_qtypes: Vec<String>,
    force_fq: Vec<String>,
    host_map: HashMap<String, Ipv4Addr>,
    block_hosts: Vec<String>,
    block_bloom: Option<BloomFilter>,
    additional_block_hosts: Vec<String>,
    chnroutes: ChnRouteTrie,
    cache: Option<TtlCache<String, Vec<u8>>>,
    prefetch: Option<PrefetchConfig>,
    shutdown: Notify,
}

impl DnsSplitter {
    pub fn new(config: DnsSplitterConfig) -> Result<Self, DnsSplitterError> {
        let mut block_hosts = Vec::new();
        let mut block_bloom = None;

        if let Some(path) = &config.block_host_file {
            let contents = std::fs::read_to_string(path).map_err(DnsSplitterError::BlockHostFile)?;
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                block_hosts.push(line.to_string());
            }

            let mut bf = BloomFilter::new(block_hosts.len().max(1), BLOCKLIST_BLOOM_ERROR_RATE)?;
            for host in &block_hosts {
                bf.add(host.as_bytes());
            }
            block_bloom = Some(bf);
        }

        let mut chnroutes = ChnRouteTrie::new();
        chnroutes.load_lines(config.chnroutes.iter().map(String::as_str))?;

        let cache = if config.enable_cache {
            Some(TtlCache::new(CACHE_SIZE)?)
        } else {
            None
        };

        Ok(Self {
            listen_addr: config.listen_addr,
            cn_dns: SocketAddr::new(config.cn_dns.into(), DNS_PORT),
            fq_dns: SocketAddr::new(config.fq_dns.into(), DNS_PORT),
            enforce_ttl: config.enforce_ttl,
            disable_qtypes: config.disable_qtypes,
            force_fq: config.force_fq,
            host_map: config.host_map,
            block_hosts,
            block_bloom,
            additional_block_hosts: config.additional_block_hosts,
            chnroutes,
            cache,
            prefetch: config.prefetch,
            shutdown: Notify::new(),
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let socket = Arc::new(UdpSocket::bind(self.listen_addr).await?);
        info!(addr = %self.listen_addr, "dns server listening");

        if let Some(prefetch) = self.prefetch {
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.prefetch_loop(prefetch).await });
        }

        let mut buf = vec![0u8; UDP_RECV_BUF];
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("dns server shutting down");
                    return Ok(());
                }
                res = socket.recv_from(&mut buf) => {
                    let (n, src) = res?;
                    let data = buf[..n].to_vec();
                    let this = Arc::clone(&self);
                    let sock = Arc::clone(&socket);
                    tokio::spawn(async move {
                        // A panicking handler must not take the server down with it: the
                        // inner task's panic is caught at its join boundary and logged,
                        // mirroring the Go original's per-goroutine recover().
                        let task = tokio::spawn(async move { this.handle_datagram(sock, data, src).await });
                        if let Err(join_err) = task.await {
                            error!(error = %join_err, %src, "dns datagram handler panicked, recovered");
                        }
                    });
                }
            }
        }
    }

    async fn handle_datagram(&self, socket: Arc<UdpSocket>, data: Vec<u8>, src: SocketAddr) {
        match self.handle(&data).await {
            Ok(Some(resp)) => {
                if let Err(e) = socket.send_to(&resp, src).await {
                    error!(error = %e, %src, "failed to send dns response");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, %src, "dropping malformed dns query");
            }
        }
    }

    /// Runs the full per-query policy pipeline and returns the wire bytes
    /// to send back to the client, or `None` if nothing should be sent
    /// (reserved for future short-circuits; every current path replies).
    async fn handle(&self, data: &[u8]) -> Result<Option<Vec<u8>>, DnsWireError> {
        let query = snet_dns_wire::parse(data)?;

        if self.disabled_qtype(&query) {
            self.log_access(&query, AccessReason::Disabled);
            return Ok(Some(snet_dns_wire::build_empty_response(data)));
        }

        if let Some(ip) = self.host_map.get(&query.qdomain) {
            self.log_access(&query, AccessReason::Mapped);
            return Ok(Some(snet_dns_wire::build_single_a_response(data, &query.qdomain, *ip)));
        }

        if self.is_blocked(&query.qdomain) {
            self.log_access(&query, AccessReason::Blocked);
            return Ok(Some(snet_dns_wire::build_single_a_response(data, &query.qdomain, BLOCKED_IP)));
        }

        if let Some(cache) = &self.cache {
            let cache_key = query.cache_key();
            if let Some(mut cached) = cache.get(&cache_key) {
                if cached.len() <= 2 {
                    error!(qdomain = %query.qdomain, "invalid cached dns response, ignoring");
                } else {
                    cached[0] = data[0];
                    cached[1] = data[1];
                    self.log_access(&query, AccessReason::Cached);
                    return Ok(Some(cached));
                }
            }
        }

        let outcome = self.do_query(data, &query.qdomain).await;

        if let Some((raw, reason)) = outcome {
            self.log_access(&query, reason);
            if let Some(cache) = &self.cache {
                if !raw.is_empty() {
                    let ttl = self.select_ttl(&raw);
                    cache.add(query.cache_key(), raw.clone(), Duration::from_secs(u64::from(ttl)));
                }
            }
            return Ok(Some(raw));
        }

        Ok(None)
    }

    fn disabled_qtype(&self, query: &DnsMessage) -> bool {
        let Some(name) = snet_dns_wire::qtype_name(query.qtype) else {
            return false;
        };
        self.disable_qtypes.iter().any(|t| t.eq_ignore_ascii_case(name))
    }

    fn is_blocked(&self, qdomain: &str) -> bool {
        if domain_match(qdomain, &self.additional_block_hosts) {
            return true;
        }

        if let Some(bloom) = &self.block_bloom {
            if bloom.contains(qdomain.as_bytes()) {
                return self.block_hosts.iter().any(|h| h == qdomain);
            }
        }

        false
    }

    /// Races the domestic and foreign resolvers per policy and returns the
    /// selected raw response plus the access-log reason. `None` only when
    /// both resolutions fail.
    async fn do_query(&self, data: &[u8], qdomain: &str) -> Option<(Vec<u8>, AccessReason)> {
        let fq_dns = self.fq_dns;
        let fq_data = data.to_vec();
        let fq_task = tokio::spawn(async move { query_fq(fq_dns, &fq_data).await });

        let force_fq = domain_match(qdomain, &self.force_fq);

        if !force_fq {
            match query_cn(self.cn_dns, data).await {
                Ok(cn_raw) => {
                    if let Ok(cn_msg) = snet_dns_wire::parse(&cn_raw) {
                        if is_domestic_answer(&cn_msg, &self.chnroutes) {
                            // Don't cancel the fq task; let it finish in the
                            // background so it isn't wasted work.
                            return Some((cn_raw, AccessReason::CnNoCache));
                        }
                    }
                }
                Err(e) => {
                    debug!(error = %e, qdomain, "cn dns query failed");
                }
            }
        } else {
            debug!(qdomain, "force-fq domain, skipping cn dns");
        }

        match fq_task.await {
            Ok(Ok(raw)) => Some((raw, AccessReason::FqNoCache)),
            Ok(Err(e)) => {
                warn!(error = %e, qdomain, "fq dns query failed");
                None
            }
            Err(e) => {
                warn!(error = %e, qdomain, "fq dns task panicked");
                None
            }
        }
    }

    fn select_ttl(&self, raw: &[u8]) -> u32 {
        if self.enforce_ttl > 0 {
            return self.enforce_ttl;
        }

        match snet_dns_wire::parse(raw) {
            Ok(msg) if !msg.answers.is_empty() => msg.answers[0].ttl,
            _ => DEFAULT_TTL_SECS,
        }
    }

    fn log_access(&self, query: &DnsMessage, reason: AccessReason) {
        debug!(qdomain = %query.qdomain, reason = reason.as_str(), "dns query handled");
    }

    async fn prefetch_loop(&self, prefetch: PrefetchConfig) {
        let Some(cache) = &self.cache else { return };
        let mut ticker = tokio::time::interval(prefetch.interval);

        loop {
            ticker.tick().await;
            let hot = cache.prefetch_top_n(prefetch.count);
            for item in hot {
                let Some((name, qtype)) = item.key.rsplit_once(':') else {
                    continue;
                };
                let Ok(qtype) = qtype.parse::<u16>() else {
                    continue;
                };

                let query = snet_dns_wire::build_query(0, name, qtype);
                if let Some((raw, _reason)) = self.do_query(&query, name).await {
                    cache.evict(&item.key);
                    if !raw.is_empty() {
                        let ttl = self.select_ttl(&raw);
                        cache.add(item.key.clone(), raw, Duration::from_secs(u64::from(ttl)));
                    }
                }
            }
        }
    }
}

fn is_domestic_answer(msg: &DnsMessage, chnroutes: &ChnRouteTrie) -> bool {
    match msg.answers.first() {
        Some(ARecord { ip, .. }) => chnroutes.contains(*ip),
        None => false,
    }
}

async fn query_cn(addr: SocketAddr, data: &[u8]) -> Result<Vec<u8>, QueryError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect(addr).await?;
    socket.send(data).await?;

    let mut buf = vec![0u8; UDP_RECV_BUF];
    let n = timeout(DNS_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| QueryError::Timeout)??;

    buf.truncate(n);
    Ok(buf)
}

/// Queries the foreign resolver over TCP with RFC 1035 §4.2.2
/// length-prefixed framing. The OS is expected to transparently redirect
/// this TCP connection through the upstream proxy (the same mechanism
/// component G relies on), so this function dials a plain TCP socket.
async fn query_fq(addr: SocketAddr, data: &[u8]) -> Result<Vec<u8>, QueryError> {
    let mut stream = timeout(DNS_TIMEOUT, TcpStream::connect(addr)).await.map_err(|_| QueryError::Timeout)??;

    let len_prefix = (data.len() as u16).to_be_bytes();
    timeout(DNS_TIMEOUT, async {
        stream.write_all(&len_prefix).await?;
        stream.write_all(data).await
    })
    .await
    .map_err(|_| QueryError::Timeout)??;

    let mut len_buf = [0u8; 2];
    timeout(DNS_TIMEOUT, stream.read_exact(&mut len_buf))
        .await
        .map_err(|_| QueryError::Timeout)??;
    let resp_len = u16::from_be_bytes(len_buf) as usize;

    let mut resp = vec![0u8; resp_len];
    timeout(DNS_TIMEOUT, stream.read_exact(&mut resp))
        .await
        .map_err(|_| QueryError::Timeout)??;

    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, UdpSocket as TokioUdpSocket};

    fn base_config(listen_addr: SocketAddr, cn_dns: SocketAddr, fq_dns: SocketAddr) -> DnsSplitterConfig {
        DnsSplitterConfig {
            listen_addr,
            cn_dns: match cn_dns.ip() {
                std::net::IpAddr::V4(v4) => v4,
                _ => unreachable!(),
            },
            fq_dns: match fq_dns.ip() {
                std::net::IpAddr::V4(v4) => v4,
                _ => unreachable!(),
            },
            enable_cache: true,
            enforce_ttl: 0,
            disable_qtypes: vec!["AAAA".to_string()],
            force_fq: vec![],
            host_map: HashMap::new(),
            block_host_file: None,
            additional_block_hosts: vec!["*.ads.example.com".to_string()],
            chnroutes: vec!["114.114.114.0/24".to_string()],
            prefetch: None,
        }
    }

    #[tokio::test]
    async fn disabled_qtype_returns_empty_response() {
        let splitter = DnsSplitter::new(base_config(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:5300".parse().unwrap(),
            "127.0.0.1:5301".parse().unwrap(),
        ))
        .unwrap();

        let query = snet_dns_wire::build_query(1, "example.com", snet_dns_wire::QTYPE_AAAA);
        let resp = splitter.handle(&query).await.unwrap().unwrap();

        let parsed = snet_dns_wire::parse(&resp).unwrap();
        assert!(parsed.is_response);
        assert!(parsed.answers.is_empty());
    }

    #[tokio::test]
    async fn host_map_short_circuits_resolution() {
        let mut cfg = base_config(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:5300".parse().unwrap(),
            "127.0.0.1:5301".parse().unwrap(),
        );
        cfg.host_map.insert("router.local".to_string(), Ipv4Addr::new(192, 168, 1, 1));
        let splitter = DnsSplitter::new(cfg).unwrap();

        let query = snet_dns_wire::build_query(2, "router.local", snet_dns_wire::QTYPE_A);
        let resp = splitter.handle(&query).await.unwrap().unwrap();

        let parsed = snet_dns_wire::parse(&resp).unwrap();
        assert_eq!(parsed.answers[0].ip, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[tokio::test]
    async fn wildcard_blocklist_returns_localhost() {
        let splitter = DnsSplitter::new(base_config(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:5300".parse().unwrap(),
            "127.0.0.1:5301".parse().unwrap(),
        ))
        .unwrap();

        let query = snet_dns_wire::build_query(3, "tracker.ads.example.com", snet_dns_wire::QTYPE_A);
        let resp = splitter.handle(&query).await.unwrap().unwrap();

        let parsed = snet_dns_wire::parse(&resp).unwrap();
        assert_eq!(parsed.answers[0].ip, BLOCKED_IP);
    }

    #[tokio::test]
    async fn domestic_cn_answer_wins_without_waiting_on_fq() {
        let cn_server = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cn_addr = cn_server.local_addr().unwrap();

        // An fq listener that never answers within the test's lifetime;
        // used only to prove we don't block on it.
        let fq_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let fq_addr = fq_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = fq_listener.accept().await;
            // Accept and then go silent - cn should win before fq answers.
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let cfg = base_config("127.0.0.1:0".parse().unwrap(), cn_addr, fq_addr);
        let splitter = DnsSplitter::new(cfg).unwrap();

        let domestic_ip = Ipv4Addr::new(114, 114, 114, 114);
        let query = snet_dns_wire::build_query(4, "baidu.com", snet_dns_wire::QTYPE_A);

        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let (n, src) = cn_server.recv_from(&mut buf).await.unwrap();
            let q = snet_dns_wire::parse(&buf[..n]).unwrap();
            let resp = snet_dns_wire::build_single_a_response(&buf[..n], &q.qdomain, domestic_ip);
            cn_server.send_to(&resp, src).await.unwrap();
        });

        let resp = tokio::time::timeout(Duration::from_secs(2), splitter.handle(&query))
            .await
            .expect("handle should not block on the silent fq resolver")
            .unwrap()
            .unwrap();

        responder.await.unwrap();

        let parsed = snet_dns_wire::parse(&resp).unwrap();
        assert_eq!(parsed.answers[0].ip, domestic_ip);
    }

    #[test]
    fn domain_match_is_reexported() {
        assert!(domain_match("x.example.com", &["*.example.com".to_string()]));
    }
}
