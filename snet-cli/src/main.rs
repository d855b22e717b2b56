//! Entry point tying every component together (ambient component 4.N).
//!
//! Grounded in `cli/src/main.rs` for the clap-derive shape, and in
//! `original_source/local_server.go`/`main.go` for the startup sequence:
//! load config, init logging, build the chnroutes trie, build the proxy
//! dialer, start the DNS splitter and TCP redirector, optionally the
//! upstream tunnel server and the stats HTTP server, then wait for a
//! shutdown signal and tear everything down.

use anyhow::{Context, Result};
use clap::Parser;
use snet_config::Config;
use snet_dns_splitter::{DnsSplitter, DnsSplitterConfig, PrefetchConfig};
use snet_proxy::ProxyDialer;
use snet_redirector::{RedirectorConfig, TcpRedirector};
use snet_stats::StatsAggregator;
use snet_tunnel::{TunnelServer, TunnelServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "snet", bin_name = "snet", about = "Policy-driven TCP proxy and split-horizon DNS splitter", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, short = 'c', default_value = "snet.json")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    snet_logging::setup_global_subscriber().context("failed to initialize logging")?;

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {:?}", cli.config))?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;

    match runtime.block_on(run(config)) {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(error = %e, "fatal startup error");
            std::process::exit(1);
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let chnroutes = load_chnroutes(&config)?;
    let block_hosts = load_block_hosts(&config)?;

    let dialer = ProxyDialer::init(config.proxy).await.context("failed to initialize proxy dialer")?;
    info!(proxy_ip = %dialer.proxy_ip(), "proxy dialer ready");

    let aggregator = StatsAggregator::new();
    let stats_handle = if config.enable_stat { Some(snet_stats::spawn(Arc::clone(&aggregator))) } else { None };

    let dns_splitter = Arc::new(
        DnsSplitter::new(DnsSplitterConfig {
            listen_addr: SocketAddr::new(config.listen_host, 53),
            cn_dns: config.dns.cn_dns,
            fq_dns: config.dns.fq_dns,
            enable_cache: config.dns.enable_cache,
            enforce_ttl: config.dns.enforce_ttl,
            disable_qtypes: config.dns.disable_qtypes.clone(),
            force_fq: config.dns.force_fq.clone(),
            host_map: config.dns.host_map.clone(),
            block_host_file: config.dns.block_host_file.clone(),
            additional_block_hosts: block_hosts,
            chnroutes,
            prefetch: config.dns.prefetch_enable.then_some(PrefetchConfig {
                interval: config.dns.prefetch_interval,
                count: config.dns.prefetch_count,
            }),
        })
        .context("failed to construct dns splitter")?,
    );

    let redirector = Arc::new(
        TcpRedirector::new(
            RedirectorConfig {
                listen_addr: SocketAddr::new(config.listen_host, config.listen_port),
                proxy_timeout: config.proxy_timeout,
                enable_sniff: config.enable_stat,
                stats: stats_handle.clone(),
            },
            dialer,
        )
        .await
        .context("failed to bind tcp redirector")?,
    );

    let tunnel_server = match &config.upstream {
        Some(upstream) => {
            let (cert_chain, private_key) = load_tls_identity(&upstream.cert_path, &upstream.key_path)?;
            Some(Arc::new(
                TunnelServer::new(TunnelServerConfig {
                    listen_addr: upstream.listen_addr,
                    cert_chain,
                    private_key,
                    token: upstream.token.clone(),
                })
                .context("failed to construct upstream tunnel server")?,
            ))
        }
        None => None,
    };

    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn({
        let dns_splitter = Arc::clone(&dns_splitter);
        async move { ("dns splitter", dns_splitter.run().await.map_err(anyhow::Error::from)) }
    });

    tasks.spawn({
        let redirector = Arc::clone(&redirector);
        async move { ("tcp redirector", redirector.run().await.map_err(anyhow::Error::from)) }
    });

    if let Some(tunnel) = &tunnel_server {
        let tunnel = Arc::clone(tunnel);
        tasks.spawn(async move { ("upstream tunnel server", tunnel.run().await.map_err(anyhow::Error::from)) });
    }

    if config.enable_stat {
        let addr = SocketAddr::new(config.listen_host, config.stat_port);
        let aggregator = Arc::clone(&aggregator);
        tasks.spawn(async move { ("stats server", snet_stats::serve(addr, aggregator).await) });
    }

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received, stopping");
        }
        Some(finished) = tasks.join_next() => {
            match finished {
                Ok((name, Ok(()))) => info!(component = name, "task exited cleanly"),
                Ok((name, Err(e))) => error!(component = name, error = %e, "task failed"),
                Err(e) => error!(error = %e, "task panicked"),
            }
        }
    }

    dns_splitter.shutdown();
    redirector.shutdown();
    if let Some(tunnel) = &tunnel_server {
        tunnel.shutdown();
    }

    tasks.shutdown().await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn load_chnroutes(config: &Config) -> Result<Vec<String>> {
    match &config.dns.chnroutes_file {
        Some(path) => snet_config::load_chnroutes(path).with_context(|| format!("failed to load chnroutes file {path:?}")),
        None => Ok(Vec::new()),
    }
}

fn load_block_hosts(config: &Config) -> Result<Vec<String>> {
    let mut hosts = config.dns.block_hosts.clone();
    hosts.retain(|h| !h.is_empty());
    Ok(hosts)
}

fn load_tls_identity(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> Result<(Vec<rustls_pki_types::CertificateDer<'static>>, rustls_pki_types::PrivateKeyDer<'static>)> {
    let cert_bytes = std::fs::read(cert_path).with_context(|| format!("failed to read cert file {cert_path:?}"))?;
    let key_bytes = std::fs::read(key_path).with_context(|| format!("failed to read key file {key_path:?}"))?;

    let cert_chain: Vec<_> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .collect::<Result<_, _>>()
        .with_context(|| format!("failed to parse certificate chain in {cert_path:?}"))?;
    anyhow::ensure!(!cert_chain.is_empty(), "certificate file {cert_path:?} contained no certificates");

    let private_key = rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .with_context(|| format!("failed to parse private key in {key_path:?}"))?
        .with_context(|| format!("private key file {key_path:?} contained no key"))?;

    Ok((cert_chain, private_key))
}
