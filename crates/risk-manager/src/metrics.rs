//! Lock-free counters for the risk loop and the health report built from
//! them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::circuit_breaker::BreakerSnapshot;

const ERROR_WINDOW_MINUTES: usize = 5;

/// Counts for one monitoring cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub positions: usize,
    pub cache_hits: u64,
    pub api_calls: u64,
    pub stale: u64,
    pub exits: u64,
    pub errors: u64,
}

#[derive(Default)]
pub struct RiskMetrics {
    pub running: AtomicBool,
    pub cycles: AtomicU64,
    pub last_cycle_duration_ms: AtomicU64,
    pub active_positions: AtomicU64,
    pub exits_executed: AtomicU64,
    pub exit_failures: AtomicU64,
    pub stale_pnl_reads: AtomicU64,
    pub api_calls: AtomicU64,
    pub cache_hits: AtomicU64,
    pub rule_errors: AtomicU64,
    pub position_errors: AtomicU64,
    pub reconcile_runs: AtomicU64,
    pub reconciled_positions: AtomicU64,
    pub ticks: AtomicU64,
    error_counts: [AtomicU64; ERROR_WINDOW_MINUTES],
    error_minutes: [AtomicU64; ERROR_WINDOW_MINUTES],
}

impl RiskMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&self, duration_ms: u64, stats: &CycleStats) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_duration_ms
            .store(duration_ms, Ordering::Relaxed);
        self.active_positions
            .store(stats.positions as u64, Ordering::Relaxed);
        self.cache_hits.fetch_add(stats.cache_hits, Ordering::Relaxed);
        self.api_calls.fetch_add(stats.api_calls, Ordering::Relaxed);
        self.stale_pnl_reads.fetch_add(stats.stale, Ordering::Relaxed);
    }

    /// Count one error in the current minute's bucket.
    pub fn record_error(&self, at: DateTime<Utc>) {
        let minute = epoch_minute(at);
        let slot = (minute % ERROR_WINDOW_MINUTES as u64) as usize;
        let previous = self.error_minutes[slot].swap(minute, Ordering::AcqRel);
        if previous != minute {
            self.error_counts[slot].store(0, Ordering::Release);
        }
        self.error_counts[slot].fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_exit_failure(&self, at: DateTime<Utc>) {
        self.exit_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error(at);
    }

    /// Errors recorded in the five minutes up to `now`.
    pub fn recent_errors(&self, now: DateTime<Utc>) -> u64 {
        let current = epoch_minute(now);
        (0..ERROR_WINDOW_MINUTES)
            .filter(|&slot| {
                let minute = self.error_minutes[slot].load(Ordering::Acquire);
                minute <= current && current - minute < ERROR_WINDOW_MINUTES as u64
            })
            .map(|slot| self.error_counts[slot].load(Ordering::Acquire))
            .sum()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }
}

fn epoch_minute(at: DateTime<Utc>) -> u64 {
    // Slot stamps start at zero, so offset by one to keep minute 0 distinct.
    (at.timestamp().max(0) as u64) / 60 + 1
}

/// Health payload served at `/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub running: bool,
    pub last_cycle_duration_ms: u64,
    pub active_position_count: u64,
    pub circuit_breaker_state: String,
    pub circuit_breakers: Vec<BreakerSnapshot>,
    pub recent_error_count: u64,
    pub uptime_secs: u64,
    pub cycles: u64,
    pub exits_executed: u64,
    pub exit_failures: u64,
    pub stale_pnl_reads: u64,
    pub api_calls: u64,
    pub cache_hits: u64,
    pub rule_errors: u64,
    pub supervisor_restarts: u64,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.running && self.circuit_breaker_state != "open"
    }
}
