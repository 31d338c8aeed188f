//! Link efficiency sampling
//!
//! Periodically logs how much of the link traffic is payload, the payload
//! and raw throughput, and how much CPU the process spent moving it.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::link::{LinkHandle, LinkStats};

/// Rates derived from two consecutive samples
#[derive(Debug, Clone, PartialEq)]
pub struct EfficiencyReport {
    pub data_rx: u64,
    pub raw_rx: u64,
    pub data_tx: u64,
    pub raw_tx: u64,
    /// Fraction of raw bytes that were not payload
    pub overhead_rx: Option<f64>,
    pub overhead_tx: Option<f64>,
    /// Bytes per second over the wall-clock interval
    pub data_rx_rate: f64,
    pub raw_rx_rate: f64,
    pub data_tx_rate: f64,
    pub raw_tx_rate: f64,
    pub cpu_time: Duration,
    /// CPU time as a fraction of the wall-clock interval
    pub cpu_share: f64,
    /// Bytes moved per CPU second
    pub data_cpu_rate: Option<f64>,
    pub raw_cpu_rate: Option<f64>,
}

impl EfficiencyReport {
    /// Compare two counter snapshots; `None` when nothing moved
    pub fn between(previous: &LinkStats, current: &LinkStats, elapsed: Duration, cpu_time: Duration) -> Option<Self> {
        let data_rx = current.data_bytes_received.saturating_sub(previous.data_bytes_received);
        let raw_rx = current.raw_bytes_received.saturating_sub(previous.raw_bytes_received);
        let data_tx = current.data_bytes_sent.saturating_sub(previous.data_bytes_sent);
        let raw_tx = current.raw_bytes_sent.saturating_sub(previous.raw_bytes_sent);

        if data_rx == 0 && raw_rx == 0 && data_tx == 0 && raw_tx == 0 {
            return None;
        }

        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let cpu_secs = cpu_time.as_secs_f64();
        let per_cpu = |bytes: u64| (cpu_secs > 0.0).then(|| bytes as f64 / cpu_secs);

        Some(Self {
            data_rx,
            raw_rx,
            data_tx,
            raw_tx,
            overhead_rx: overhead(data_rx, raw_rx),
            overhead_tx: overhead(data_tx, raw_tx),
            data_rx_rate: data_rx as f64 / secs,
            raw_rx_rate: raw_rx as f64 / secs,
            data_tx_rate: data_tx as f64 / secs,
            raw_tx_rate: raw_tx as f64 / secs,
            cpu_time,
            cpu_share: cpu_secs / secs,
            data_cpu_rate: per_cpu(data_rx + data_tx),
            raw_cpu_rate: per_cpu(raw_rx + raw_tx),
        })
    }

    pub fn log(&self) {
        tracing::info!(
            "Incoming overhead: {} ({} data bytes out of {} raw bytes)",
            percent(self.overhead_rx),
            self.data_rx,
            self.raw_rx
        );
        tracing::info!(
            "Outgoing overhead: {} ({} data bytes out of {} raw bytes)",
            percent(self.overhead_tx),
            self.data_tx,
            self.raw_tx
        );
        tracing::info!(
            "Incoming data speed: {:.2} kb/s, raw speed: {:.2} kb/s",
            self.data_rx_rate / 1024.0,
            self.raw_rx_rate / 1024.0
        );
        tracing::info!(
            "Outgoing data speed: {:.2} kb/s, raw speed: {:.2} kb/s",
            self.data_tx_rate / 1024.0,
            self.raw_tx_rate / 1024.0
        );
        tracing::info!(
            "Processor time spent: {:?} ({:.2}%) (data speed: {:.2} kb/s, raw speed: {:.2} kb/s)",
            self.cpu_time,
            self.cpu_share * 100.0,
            self.data_cpu_rate.unwrap_or(0.0) / 1024.0,
            self.raw_cpu_rate.unwrap_or(0.0) / 1024.0
        );
    }
}

fn overhead(data: u64, raw: u64) -> Option<f64> {
    if raw == 0 {
        return None;
    }
    Some((raw as f64 - data as f64) / raw as f64)
}

fn percent(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.2}%", v * 100.0),
        None => "n/a".to_string(),
    }
}

/// Keeps the previous snapshot between samples
pub struct EfficiencyMonitor {
    last_stats: LinkStats,
    last_cpu: Duration,
    last_measured: Instant,
}

impl EfficiencyMonitor {
    pub fn new(stats: LinkStats, cpu: Duration, now: Instant) -> Self {
        Self {
            last_stats: stats,
            last_cpu: cpu,
            last_measured: now,
        }
    }

    /// Take a sample; an idle interval only moves the clock forward
    pub fn sample(&mut self, stats: LinkStats, cpu: Duration, now: Instant) -> Option<EfficiencyReport> {
        let elapsed = now.saturating_duration_since(self.last_measured);
        self.last_measured = now;

        let report = EfficiencyReport::between(&self.last_stats, &stats, elapsed, cpu.saturating_sub(self.last_cpu))?;
        self.last_stats = stats;
        self.last_cpu = cpu;
        Some(report)
    }
}

/// User plus system CPU time consumed by this process
pub fn process_cpu_time() -> Duration {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if ret != 0 {
        return Duration::ZERO;
    }
    timeval(usage.ru_utime) + timeval(usage.ru_stime)
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Log efficiency for `link` every `period` until `cancel` fires
pub async fn monitor(link: LinkHandle, period: Duration, cancel: CancellationToken) {
    let mut monitor = EfficiencyMonitor::new(LinkStats::default(), process_cpu_time(), Instant::now());
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = link.closed() => break,
            _ = ticker.tick() => {
                if let Some(report) = monitor.sample(link.stats(), process_cpu_time(), Instant::now()) {
                    report.log();
                }
            }
        }
    }
}
