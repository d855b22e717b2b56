//! Per-host rolling traffic accounting and the `/stats` HTTP endpoint.
//!
//! Grounded in `original_source/stat/stat.go`: a ring of 3 cumulative
//! byte-count samples per host, refreshed once per second, with the
//! instantaneous rate read off the newest and oldest samples in the ring
//! (a 2-second window). The single-consumer aggregator task and the lossy
//! `try_send` sample channel follow the pattern in `relay/src/main.rs`'s
//! `relayed_data_sender` fan-in, adapted to a bounded(1) channel per the
//! §5 "stats sinks may drop rather than block" policy.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const RING_SIZE: usize = 3;
const TICK_INTERVAL: Duration = Duration::from_secs(1);
const RATE_WINDOW: Duration = Duration::from_secs(2);
const SAMPLE_CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

#[derive(Debug, Clone)]
struct Sample {
    host: String,
    port: u16,
    direction: Direction,
    bytes: u64,
}

#[derive(Default)]
struct HostCounters {
    total_rx: u64,
    total_tx: u64,
    rx_ring: [u64; RING_SIZE],
    tx_ring: [u64; RING_SIZE],
}

impl HostCounters {
    fn tick(&mut self) {
        self.rx_ring.rotate_left(1);
        self.rx_ring[RING_SIZE - 1] = self.total_rx;
        self.tx_ring.rotate_left(1);
        self.tx_ring[RING_SIZE - 1] = self.total_tx;
    }

    fn rx_rate(&self) -> f64 {
        rate(self.rx_ring)
    }

    fn tx_rate(&self) -> f64 {
        rate(self.tx_ring)
    }
}

fn rate(ring: [u64; RING_SIZE]) -> f64 {
    let delta = ring[RING_SIZE - 1].saturating_sub(ring[0]);
    delta as f64 / RATE_WINDOW.as_secs_f64()
}

struct Inner {
    start: Instant,
    hosts: HashMap<(String, u16), HostCounters>,
}

/// The process-wide stats aggregator: owns per-host cumulative counters
/// and the ring history used to derive instantaneous rates.
pub struct StatsAggregator {
    inner: Mutex<Inner>,
}

impl StatsAggregator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                start: Instant::now(),
                hosts: HashMap::new(),
            }),
        })
    }

    fn record(&self, sample: Sample) {
        let mut inner = self.inner.lock();
        let counters = inner.hosts.entry((sample.host, sample.port)).or_default();
        match sample.direction {
            Direction::Rx => counters.total_rx += sample.bytes,
            Direction::Tx => counters.total_tx += sample.bytes,
        }
    }

    fn tick(&self) {
        let mut inner = self.inner.lock();
        for counters in inner.hosts.values_mut() {
            counters.tick();
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock();

        let mut total_rx = 0u64;
        let mut total_tx = 0u64;
        let mut hosts = Vec::with_capacity(inner.hosts.len());

        for ((host, port), counters) in &inner.hosts {
            total_rx += counters.total_rx;
            total_tx += counters.total_tx;
            hosts.push(HostStats {
                host: host.clone(),
                port: *port,
                rx_rate: counters.rx_rate(),
                tx_rate: counters.tx_rate(),
                rx_size: counters.total_rx,
                tx_size: counters.total_tx,
            });
        }

        StatsSnapshot {
            uptime: inner.start.elapsed().as_secs(),
            total: Totals { rx: total_rx, tx: total_tx },
            hosts,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Totals {
    pub rx: u64,
    pub tx: u64,
}

#[derive(Debug, Serialize)]
pub struct HostStats {
    pub host: String,
    pub port: u16,
    pub rx_rate: f64,
    pub tx_rate: f64,
    pub rx_size: u64,
    pub tx_size: u64,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub uptime: u64,
    pub total: Totals,
    pub hosts: Vec<HostStats>,
}

/// A cheap, cloneable handle pipe tasks use to record byte counts. Sends
/// are lossy: if the single-slot channel is full, the sample is dropped
/// rather than blocking the pipe.
#[derive(Clone)]
pub struct StatsHandle {
    tx: mpsc::Sender<Sample>,
}

impl StatsHandle {
    pub fn record(&self, host: &str, port: u16, direction: Direction, bytes: u64) {
        if bytes == 0 {
            return;
        }

        let sample = Sample { host: host.to_string(), port, direction, bytes };
        if self.tx.try_send(sample).is_err() {
            tracing::trace!(host, port, "dropping stats sample, channel full");
        }
    }
}

/// Spawns the single-consumer aggregator task (draining samples) and the
/// 1-second ring tick task. Returns a [`StatsHandle`] for producers.
pub fn spawn(aggregator: Arc<StatsAggregator>) -> StatsHandle {
    let (tx, mut rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);

    let consumer = Arc::clone(&aggregator);
    tokio::spawn(async move {
        while let Some(sample) = rx.recv().await {
            consumer.record(sample);
        }
    });

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            aggregator.tick();
        }
    });

    StatsHandle { tx }
}

/// Serves `GET /stats` returning the JSON snapshot described in spec §6.
pub async fn serve(addr: impl Into<SocketAddr>, aggregator: Arc<StatsAggregator>) -> anyhow::Result<()> {
    let addr = addr.into();

    let app = Router::new()
        .route("/stats", get(stats_handler))
        .with_state(aggregator);

    tracing::info!(%addr, "stats server listening");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;

    Ok(())
}

async fn stats_handler(State(aggregator): State<Arc<StatsAggregator>>) -> Json<StatsSnapshot> {
    Json(aggregator.snapshot())
}
