//! Statistics tracking for the relay.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::info;

use crate::error::Result;
use crate::eventloop::{Context, Handler, Ready, Token};

/// Atomic counters shared between the loop thread and observers.
pub struct Stats {
    pub tcp_opened: AtomicU64,
    pub tcp_closed: AtomicU64,
    pub tcp_evicted: AtomicU64,
    pub tcp_failed: AtomicU64,
    pub udp_opened: AtomicU64,
    pub udp_evicted: AtomicU64,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
    pub dns_queries: AtomicU64,
    pub dns_cache_hits: AtomicU64,
    pub dns_failures: AtomicU64,
    tcp_active: AtomicU64,
    udp_active: AtomicU64,
    started: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            tcp_opened: AtomicU64::new(0),
            tcp_closed: AtomicU64::new(0),
            tcp_evicted: AtomicU64::new(0),
            tcp_failed: AtomicU64::new(0),
            udp_opened: AtomicU64::new(0),
            udp_evicted: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            dns_queries: AtomicU64::new(0),
            dns_cache_hits: AtomicU64::new(0),
            dns_failures: AtomicU64::new(0),
            tcp_active: AtomicU64::new(0),
            udp_active: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_tcp_opened(&self) {
        self.tcp_opened.fetch_add(1, Ordering::Relaxed);
        self.tcp_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_closed(&self) {
        self.tcp_closed.fetch_add(1, Ordering::Relaxed);
        decrement(&self.tcp_active);
    }

    pub fn record_tcp_evicted(&self) {
        self.tcp_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_failed(&self) {
        self.tcp_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_opened(&self) {
        self.udp_opened.fetch_add(1, Ordering::Relaxed);
        self.udp_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_closed(&self, evicted: bool) {
        if evicted {
            self.udp_evicted.fetch_add(1, Ordering::Relaxed);
        }
        decrement(&self.udp_active);
    }

    pub fn add_bytes_up(&self, n: usize) {
        self.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, n: usize) {
        self.bytes_down.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_dns_query(&self) {
        self.dns_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_cache_hit(&self) {
        self.dns_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_failure(&self) {
        self.dns_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values, leaving the counters untouched.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.collect(|counter| counter.load(Ordering::Relaxed))
    }

    /// Current values, zeroing the counters. Active gauges are kept.
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        self.collect(|counter| counter.swap(0, Ordering::Relaxed))
    }

    fn collect(&self, read: impl Fn(&AtomicU64) -> u64) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            tcp_active: self.tcp_active.load(Ordering::Relaxed),
            udp_active: self.udp_active.load(Ordering::Relaxed),
            tcp_opened: read(&self.tcp_opened),
            tcp_closed: read(&self.tcp_closed),
            tcp_evicted: read(&self.tcp_evicted),
            tcp_failed: read(&self.tcp_failed),
            udp_opened: read(&self.udp_opened),
            udp_evicted: read(&self.udp_evicted),
            bytes_up: read(&self.bytes_up),
            bytes_down: read(&self.bytes_down),
            dns_queries: read(&self.dns_queries),
            dns_cache_hits: read(&self.dns_cache_hits),
            dns_failures: read(&self.dns_failures),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

fn decrement(gauge: &AtomicU64) {
    let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub tcp_active: u64,
    pub udp_active: u64,
    pub tcp_opened: u64,
    pub tcp_closed: u64,
    pub tcp_evicted: u64,
    pub tcp_failed: u64,
    pub udp_opened: u64,
    pub udp_evicted: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub dns_queries: u64,
    pub dns_cache_hits: u64,
    pub dns_failures: u64,
}

/// Periodic handler that logs and resets the counters.
pub struct StatsReporter {
    stats: Arc<Stats>,
    interval: Duration,
    last_report: Instant,
}

impl StatsReporter {
    pub fn new(stats: Arc<Stats>, interval: Duration) -> Self {
        Self {
            stats,
            interval,
            last_report: Instant::now(),
        }
    }
}

impl Handler for StatsReporter {
    fn handle_event(&mut self, _ctx: &mut Context<'_>, _token: Token, _ready: Ready) -> Result<()> {
        Ok(())
    }

    fn handle_periodic(&mut self, ctx: &mut Context<'_>) {
        if ctx.now().saturating_duration_since(self.last_report) < self.interval {
            return;
        }
        self.last_report = ctx.now();
        let s = self.stats.snapshot_and_reset();
        info!(
            uptime = s.uptime_secs,
            tcp_active = s.tcp_active,
            udp_active = s.udp_active,
            tcp_opened = s.tcp_opened,
            tcp_closed = s.tcp_closed,
            tcp_evicted = s.tcp_evicted,
            tcp_failed = s.tcp_failed,
            udp_opened = s.udp_opened,
            udp_evicted = s.udp_evicted,
            bytes_up = s.bytes_up,
            bytes_down = s.bytes_down,
            dns_queries = s.dns_queries,
            dns_cache_hits = s.dns_cache_hits,
            dns_failures = s.dns_failures,
            "stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_zeroes_counters_but_keeps_gauges() {
        let stats = Stats::new();
        stats.record_tcp_opened();
        stats.record_tcp_opened();
        stats.record_tcp_closed();
        stats.add_bytes_up(100);
        stats.record_dns_query();

        let first = stats.snapshot_and_reset();
        assert_eq!(first.tcp_opened, 2);
        assert_eq!(first.tcp_closed, 1);
        assert_eq!(first.tcp_active, 1);
        assert_eq!(first.bytes_up, 100);
        assert_eq!(first.dns_queries, 1);

        let second = stats.snapshot();
        assert_eq!(second.tcp_opened, 0);
        assert_eq!(second.bytes_up, 0);
        assert_eq!(second.tcp_active, 1);
    }

    #[test]
    fn gauges_never_underflow() {
        let stats = Stats::new();
        stats.record_udp_closed(true);

        let s = stats.snapshot();
        assert_eq!(s.udp_active, 0);
        assert_eq!(s.udp_evicted, 1);
    }
}
