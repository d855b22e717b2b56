//! JSON configuration loading (ambient component 4.L).
//!
//! Grounded in `original_source/config/config.go` for the key set,
//! defaults, and the flat `<proxy>-*` naming for per-upstream fields;
//! reshaped per spec §9's REDESIGN FLAGS into a validated Rust struct
//! instead of a `map[string]interface{}` bag inspected ad hoc at each call
//! site. Field names use `kebab-case` on the wire to match spec §6's
//! config table exactly.

use serde::Deserialize;
use snet_proxy::{HttpConfig, ProxyDialerConfig, Socks5Config, SsConfig, TlsConfig};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0:?}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown proxy-type {0:?}")]
    UnknownProxyType(String),
    #[error("proxy-type {0:?} requires the {1:?} field")]
    MissingProxyField(&'static str, &'static str),
    #[error("as-upstream requires upstream-cert, upstream-key, and upstream-token")]
    IncompleteUpstreamConfig,
    #[error("failed to read {0:?}: {1}")]
    ReadAux(PathBuf, #[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ProxyScope {
    #[serde(rename = "bypassCN")]
    BypassCn,
    #[serde(rename = "global")]
    Global,
}

impl Default for ProxyScope {
    fn default() -> Self {
        ProxyScope::BypassCn
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Local,
    Router,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Local
    }
}

fn default_listen_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}
fn default_listen_port() -> u16 {
    1111
}
fn default_proxy_timeout() -> u64 {
    30
}
fn default_cn_dns() -> Ipv4Addr {
    Ipv4Addr::new(223, 6, 6, 6)
}
fn default_fq_dns() -> Ipv4Addr {
    Ipv4Addr::new(8, 8, 8, 8)
}
fn default_prefetch_count() -> usize {
    10
}
fn default_prefetch_interval() -> u64 {
    10
}
fn default_stat_port() -> u16 {
    8810
}

/// The raw, `#[derive(Deserialize)]` shape of the config file. Mirrors
/// spec §6's table field-for-field; per-proxy-kind fields stay flat
/// (`http_host`, `socks5_host`, ...) exactly as the original JSON does,
/// and are picked apart into a single [`ProxyDialerConfig`] variant by
/// [`Config::load`] once `proxy-type` is known.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawConfig {
    #[serde(default = "default_listen_host")]
    listen_host: IpAddr,
    #[serde(default = "default_listen_port")]
    listen_port: u16,

    proxy_type: String,
    #[serde(default = "default_proxy_timeout")]
    proxy_timeout: u64,
    #[serde(default)]
    proxy_scope: ProxyScope,
    #[serde(default)]
    bypass_hosts: Vec<String>,
    #[serde(default)]
    bypass_src_ips: Vec<IpAddr>,

    http_host: Option<Ipv4Addr>,
    http_port: Option<u16>,
    #[serde(default)]
    http_user: String,
    #[serde(default)]
    http_password: String,

    socks5_host: Option<Ipv4Addr>,
    socks5_port: Option<u16>,
    #[serde(default)]
    socks5_user: String,
    #[serde(default)]
    socks5_password: String,

    ss_host: Option<Ipv4Addr>,
    ss_port: Option<u16>,
    #[serde(default)]
    ss_password: String,

    tls_host: Option<String>,
    tls_port: Option<u16>,
    #[serde(default)]
    tls_token: String,

    #[serde(default = "default_cn_dns")]
    cn_dns: Ipv4Addr,
    #[serde(default = "default_fq_dns")]
    fq_dns: Ipv4Addr,

    #[serde(default)]
    enable_dns_cache: bool,
    #[serde(default)]
    enforce_ttl: u32,

    #[serde(default)]
    dns_prefetch_enable: bool,
    #[serde(default = "default_prefetch_count")]
    dns_prefetch_count: usize,
    #[serde(default = "default_prefetch_interval")]
    dns_prefetch_interval: u64,

    #[serde(default)]
    disable_qtypes: Vec<String>,
    #[serde(default)]
    force_fq: Vec<String>,
    #[serde(default)]
    host_map: HashMap<String, Ipv4Addr>,
    block_host_file: Option<PathBuf>,
    #[serde(default)]
    block_hosts: Vec<String>,
    chnroutes_file: Option<PathBuf>,

    #[serde(default)]
    mode: Mode,

    #[serde(default)]
    as_upstream: bool,
    upstream_tls_server_listen: Option<SocketAddr>,
    #[serde(default)]
    upstream_tls_token: String,
    upstream_tls_crt: Option<PathBuf>,
    upstream_tls_key: Option<PathBuf>,

    #[serde(default)]
    enable_stat: bool,
    #[serde(default = "default_stat_port")]
    stat_port: u16,
}

/// DNS splitter configuration knobs, validated and ready to feed into
/// `snet_dns_splitter::DnsSplitterConfig` (kept separate from that crate
/// to avoid a dependency cycle; `snet-cli` does the final translation).
#[derive(Debug, Clone)]
pub struct DnsConfig {
    pub cn_dns: Ipv4Addr,
    pub fq_dns: Ipv4Addr,
    pub enable_cache: bool,
    pub enforce_ttl: u32,
    pub prefetch_enable: bool,
    pub prefetch_count: usize,
    pub prefetch_interval: Duration,
    pub disable_qtypes: Vec<String>,
    pub force_fq: Vec<String>,
    pub host_map: HashMap<String, Ipv4Addr>,
    pub block_host_file: Option<PathBuf>,
    pub block_hosts: Vec<String>,
    pub chnroutes_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct UpstreamServerConfig {
    pub listen_addr: SocketAddr,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub token: String,
}

/// A fully loaded and validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: IpAddr,
    pub listen_port: u16,
    pub proxy_timeout: Duration,
    pub proxy_scope: ProxyScope,
    pub bypass_hosts: Vec<String>,
    pub bypass_src_ips: Vec<IpAddr>,
    pub proxy: ProxyDialerConfig,
    pub dns: DnsConfig,
    pub mode: Mode,
    pub upstream: Option<UpstreamServerConfig>,
    pub enable_stat: bool,
    pub stat_port: u16,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let proxy = build_proxy_config(&raw)?;

        let upstream = if raw.as_upstream {
            if raw.upstream_tls_token.is_empty() {
                return Err(ConfigError::IncompleteUpstreamConfig);
            }

            Some(UpstreamServerConfig {
                listen_addr: raw.upstream_tls_server_listen.ok_or(ConfigError::IncompleteUpstreamConfig)?,
                cert_path: raw.upstream_tls_crt.clone().ok_or(ConfigError::IncompleteUpstreamConfig)?,
                key_path: raw.upstream_tls_key.clone().ok_or(ConfigError::IncompleteUpstreamConfig)?,
                token: raw.upstream_tls_token.clone(),
            })
        } else {
            None
        };

        Ok(Config {
            listen_host: raw.listen_host,
            listen_port: raw.listen_port,
            proxy_timeout: Duration::from_secs(raw.proxy_timeout),
            proxy_scope: raw.proxy_scope,
            bypass_hosts: raw.bypass_hosts.clone(),
            bypass_src_ips: raw.bypass_src_ips.clone(),
            proxy,
            dns: DnsConfig {
                cn_dns: raw.cn_dns,
                fq_dns: raw.fq_dns,
                enable_cache: raw.enable_dns_cache,
                enforce_ttl: raw.enforce_ttl,
                prefetch_enable: raw.dns_prefetch_enable,
                prefetch_count: raw.dns_prefetch_count,
                prefetch_interval: Duration::from_secs(raw.dns_prefetch_interval),
                disable_qtypes: raw.disable_qtypes,
                force_fq: raw.force_fq,
                host_map: raw.host_map,
                block_host_file: raw.block_host_file,
                block_hosts: raw.block_hosts,
                chnroutes_file: raw.chnroutes_file,
            },
            mode: raw.mode,
            upstream,
            enable_stat: raw.enable_stat,
            stat_port: raw.stat_port,
        })
    }
}

fn build_proxy_config(raw: &RawConfig) -> Result<ProxyDialerConfig, ConfigError> {
    snet_proxy::known_proxy_kind(&raw.proxy_type).map_err(|_| ConfigError::UnknownProxyType(raw.proxy_type.clone()))?;

    Ok(match raw.proxy_type.as_str() {
        "http" => ProxyDialerConfig::Http(HttpConfig {
            host: raw.http_host.ok_or(ConfigError::MissingProxyField("http", "http-host"))?,
            port: raw.http_port.ok_or(ConfigError::MissingProxyField("http", "http-port"))?,
            auth_user: raw.http_user.clone(),
            auth_password: raw.http_password.clone(),
        }),
        "socks5" => ProxyDialerConfig::Socks5(Socks5Config {
            host: raw.socks5_host.ok_or(ConfigError::MissingProxyField("socks5", "socks5-host"))?,
            port: raw.socks5_port.ok_or(ConfigError::MissingProxyField("socks5", "socks5-port"))?,
            auth_user: raw.socks5_user.clone(),
            auth_password: raw.socks5_password.clone(),
        }),
        "ss" | "ss2" => ProxyDialerConfig::Ss(SsConfig {
            host: raw.ss_host.ok_or(ConfigError::MissingProxyField("ss", "ss-host"))?,
            port: raw.ss_port.ok_or(ConfigError::MissingProxyField("ss", "ss-port"))?,
            password: raw.ss_password.clone(),
        }),
        "tls" => ProxyDialerConfig::Tls(TlsConfig {
            host: raw.tls_host.clone().ok_or(ConfigError::MissingProxyField("tls", "tls-host"))?,
            port: raw.tls_port.ok_or(ConfigError::MissingProxyField("tls", "tls-port"))?,
            token: raw.tls_token.clone(),
        }),
        other => return Err(ConfigError::UnknownProxyType(other.to_string())),
    })
}

/// Loads one hostname per line, skipping blank lines and `#` comments, per
/// spec §6's block-host-file format.
pub fn load_line_list(path: impl AsRef<Path>) -> Result<Vec<String>, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadAux(path.to_path_buf(), e))?;

    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Loads one CIDR per line (no comment syntax; spec §6's chnroutes format).
pub fn load_chnroutes(path: impl AsRef<Path>) -> Result<Vec<String>, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadAux(path.to_path_buf(), e))?;

    Ok(text.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_socks5_config_parses_with_defaults() {
        let json = r#"{
            "proxy-type": "socks5",
            "socks5-host": "10.0.0.1",
            "socks5-port": 1080
        }"#;

        let config = Config::parse(json).unwrap();
        assert_eq!(config.listen_port, 1111);
        assert_eq!(config.proxy_scope, ProxyScope::BypassCn);
        assert_eq!(config.dns.cn_dns, Ipv4Addr::new(223, 6, 6, 6));
        assert!(matches!(config.proxy, ProxyDialerConfig::Socks5(_)));
    }

    #[test]
    fn proxy_scope_bypass_cn_wire_value_parses() {
        let json = r#"{
            "proxy-type": "socks5",
            "socks5-host": "10.0.0.1",
            "socks5-port": 1080,
            "proxy-scope": "bypassCN"
        }"#;

        let config = Config::parse(json).unwrap();
        assert_eq!(config.proxy_scope, ProxyScope::BypassCn);
    }

    #[test]
    fn unknown_proxy_type_is_rejected() {
        let json = r#"{"proxy-type": "wireguard"}"#;
        assert!(matches!(Config::parse(json), Err(ConfigError::UnknownProxyType(_))));
    }

    #[test]
    fn missing_required_proxy_field_is_rejected() {
        let json = r#"{"proxy-type": "http"}"#;
        assert!(matches!(Config::parse(json), Err(ConfigError::MissingProxyField("http", _))));
    }

    #[test]
    fn as_upstream_without_cert_is_rejected() {
        let json = r#"{
            "proxy-type": "socks5",
            "socks5-host": "10.0.0.1",
            "socks5-port": 1080,
            "as-upstream": true
        }"#;
        assert!(matches!(Config::parse(json), Err(ConfigError::IncompleteUpstreamConfig)));
    }

    #[test]
    fn full_config_round_trips_expected_fields() {
        let json = r#"{
            "listen-host": "0.0.0.0",
            "listen-port": 2222,
            "proxy-type": "tls",
            "tls-host": "relay.example.com",
            "tls-port": 9443,
            "tls-token": "shared-secret",
            "cn-dns": "114.114.114.114",
            "fq-dns": "1.1.1.1",
            "enable-dns-cache": true,
            "dns-prefetch-enable": true,
            "dns-prefetch-count": 5,
            "dns-prefetch-interval": 30,
            "disable-qtypes": ["AAAA"],
            "mode": "router",
            "enable-stat": true,
            "stat-port": 9001
        }"#;

        let config = Config::parse(json).unwrap();
        assert_eq!(config.listen_port, 2222);
        assert_eq!(config.mode, Mode::Router);
        assert_eq!(config.dns.prefetch_count, 5);
        assert_eq!(config.dns.prefetch_interval, Duration::from_secs(30));
        assert_eq!(config.dns.disable_qtypes, vec!["AAAA".to_string()]);
        assert!(config.enable_stat);
        assert_eq!(config.stat_port, 9001);
    }

    #[test]
    fn load_line_list_skips_blanks_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocklist.txt");
        std::fs::write(&path, "ads.example.com\n# comment\n\ntracker.example.com\n").unwrap();

        let list = load_line_list(&path).unwrap();
        assert_eq!(list, vec!["ads.example.com".to_string(), "tracker.example.com".to_string()]);
    }
}
