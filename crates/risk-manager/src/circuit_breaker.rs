//! Circuit breaker for failing external endpoints.
//!
//! Each logical endpoint key (`quotes:NFO`, `orders:live`) trips on its own.
//! A key's transitions happen under its dashmap entry lock, so concurrent
//! callers always see one consistent state machine:
//!
//! closed --(threshold consecutive failures)--> open
//! open --(cooldown elapsed, one caller admitted)--> half_open
//! half_open --(trial success)--> closed
//! half_open --(trial failure)--> open (cooldown restarted)
//!
//! A trial that never reports back (cancelled or panicked) counts as failed.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use options_core::config::RiskConfig;
use options_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// State of one breaker key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Configuration for circuit breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent open before a trial call is admitted.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl From<&RiskConfig> for CircuitBreakerConfig {
    fn from(config: &RiskConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_failure_threshold.max(1),
            cooldown: config.circuit_breaker_cooldown(),
        }
    }
}

#[derive(Debug, Clone)]
struct KeyState {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    trial_started_at: Option<Instant>,
    trips: u64,
}

impl Default for KeyState {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            opened_at: None,
            opened_at_utc: None,
            trial_in_flight: false,
            trial_started_at: None,
            trips: 0,
        }
    }
}

impl KeyState {
    fn open(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_utc = Some(Utc::now());
        self.trial_in_flight = false;
        self.trial_started_at = None;
        self.trips += 1;
    }

    fn begin_trial(&mut self) {
        self.state = BreakerState::HalfOpen;
        self.trial_in_flight = true;
        self.trial_started_at = Some(Instant::now());
    }
}

/// Records a failure for a `call` whose future is dropped or unwinds before
/// its outcome is recorded.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    key: &'a str,
    armed: bool,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(key = self.key, "Guarded call abandoned before completing");
            self.breaker.record_failure(self.key);
        }
    }
}

/// Point-in-time view of one key, for health output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub threshold: u32,
    pub cooldown_secs: u64,
    pub trips: u64,
}

/// Per-endpoint circuit breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    keys: DashMap<String, KeyState>,
    rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            keys: DashMap::new(),
            rejected: AtomicU64::new(0),
        }
    }

    /// Ask permission to call `key`. Err(CircuitOpen) means do not call.
    pub fn acquire(&self, key: &str) -> Result<()> {
        let mut entry = self.keys.entry(key.to_string()).or_default();
        let admitted = match entry.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = entry
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled {
                    entry.begin_trial();
                    info!(key = key, "Circuit half-open, admitting trial call");
                }
                cooled
            }
            BreakerState::HalfOpen => {
                // A trial silent for a whole cooldown is presumed lost.
                let lost = entry
                    .trial_started_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if entry.trial_in_flight && !lost {
                    false
                } else {
                    if entry.trial_in_flight {
                        warn!(key = key, "Trial call never reported, admitting another");
                    }
                    entry.begin_trial();
                    true
                }
            }
        };

        if admitted {
            Ok(())
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            Err(Error::CircuitOpen {
                key: key.to_string(),
            })
        }
    }

    pub fn record_success(&self, key: &str) {
        let mut entry = self.keys.entry(key.to_string()).or_default();
        if entry.state == BreakerState::HalfOpen {
            info!(key = key, "Trial call succeeded, circuit closed");
        }
        entry.state = BreakerState::Closed;
        entry.consecutive_failures = 0;
        entry.trial_in_flight = false;
        entry.trial_started_at = None;
        entry.opened_at = None;
        entry.opened_at_utc = None;
    }

    pub fn record_failure(&self, key: &str) {
        let mut entry = self.keys.entry(key.to_string()).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_failure_at = Some(Utc::now());

        match entry.state {
            BreakerState::HalfOpen => {
                entry.open();
                warn!(key = key, "Trial call failed, circuit reopened");
            }
            BreakerState::Closed if entry.consecutive_failures >= self.config.failure_threshold => {
                entry.open();
                warn!(
                    key = key,
                    failures = entry.consecutive_failures,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "Circuit opened"
                );
            }
            _ => {}
        }
    }

    /// Acquire, run `f`, record its outcome. `f` is not invoked when the
    /// circuit rejects the call. Dropping the returned future mid-call, or a
    /// panic inside it, records a failure.
    pub async fn call<T, F, Fut>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire(key)?;
        let mut pending = PendingCall {
            breaker: self,
            key,
            armed: true,
        };
        let outcome = f().await;
        pending.armed = false;
        match outcome {
            Ok(value) => {
                self.record_success(key);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(key);
                Err(e)
            }
        }
    }

    pub fn state(&self, key: &str) -> BreakerState {
        self.keys
            .get(key)
            .map(|entry| entry.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn consecutive_failures(&self, key: &str) -> u32 {
        self.keys
            .get(key)
            .map(|entry| entry.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .keys
            .iter()
            .map(|entry| BreakerSnapshot {
                key: entry.key().clone(),
                state: entry.state,
                consecutive_failures: entry.consecutive_failures,
                last_failure_at: entry.last_failure_at,
                opened_at: entry.opened_at_utc,
                threshold: self.config.failure_threshold,
                cooldown_secs: self.config.cooldown.as_secs(),
                trips: entry.trips,
            })
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Worst state across all keys.
    pub fn overall_state(&self) -> BreakerState {
        let mut overall = BreakerState::Closed;
        for entry in self.keys.iter() {
            match entry.state {
                BreakerState::Open => return BreakerState::Open,
                BreakerState::HalfOpen => overall = BreakerState::HalfOpen,
                BreakerState::Closed => {}
            }
        }
        overall
    }

    pub fn reset(&self, key: &str) {
        if self.keys.remove(key).is_some() {
            info!(key = key, "Circuit breaker reset");
        }
    }

    /// Calls rejected without I/O since startup.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3, 60_000);
        for _ in 0..2 {
            cb.acquire("quotes:NFO").unwrap();
            cb.record_failure("quotes:NFO");
        }
        assert_eq!(cb.state("quotes:NFO"), BreakerState::Closed);

        cb.acquire("quotes:NFO").unwrap();
        cb.record_failure("quotes:NFO");
        assert_eq!(cb.state("quotes:NFO"), BreakerState::Open);
        assert!(matches!(
            cb.acquire("quotes:NFO"),
            Err(Error::CircuitOpen { .. })
        ));
        assert_eq!(cb.rejected_count(), 1);
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = breaker(3, 60_000);
        cb.record_failure("quotes:NFO");
        cb.record_failure("quotes:NFO");
        cb.record_success("quotes:NFO");
        assert_eq!(cb.consecutive_failures("quotes:NFO"), 0);
        cb.record_failure("quotes:NFO");
        assert_eq!(cb.state("quotes:NFO"), BreakerState::Closed);
    }

    #[test]
    fn test_keys_are_isolated() {
        let cb = breaker(1, 60_000);
        cb.record_failure("quotes:NFO");
        assert_eq!(cb.state("quotes:NFO"), BreakerState::Open);
        assert!(cb.acquire("quotes:NSE").is_ok());
        assert!(cb.acquire("orders:paper").is_ok());
        assert_eq!(cb.overall_state(), BreakerState::Open);
    }

    #[test]
    fn test_half_open_admits_exactly_one_trial() {
        let cb = breaker(1, 20);
        cb.record_failure("quotes:NFO");
        std::thread::sleep(Duration::from_millis(40));

        assert!(cb.acquire("quotes:NFO").is_ok());
        assert_eq!(cb.state("quotes:NFO"), BreakerState::HalfOpen);
        assert!(cb.acquire("quotes:NFO").is_err());
        assert!(cb.acquire("quotes:NFO").is_err());

        cb.record_success("quotes:NFO");
        assert_eq!(cb.state("quotes:NFO"), BreakerState::Closed);
        assert_eq!(cb.consecutive_failures("quotes:NFO"), 0);
    }

    #[test]
    fn test_trial_failure_restarts_cooldown() {
        let cb = breaker(1, 30);
        cb.record_failure("quotes:NFO");
        std::thread::sleep(Duration::from_millis(50));

        cb.acquire("quotes:NFO").unwrap();
        cb.record_failure("quotes:NFO");
        assert_eq!(cb.state("quotes:NFO"), BreakerState::Open);
        // Cooldown restarted from the trial failure.
        assert!(cb.acquire("quotes:NFO").is_err());

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].trips, 2);
        assert!(snapshot[0].opened_at.is_some());
    }

    #[tokio::test]
    async fn test_call_skips_io_when_open() {
        let cb = breaker(10, 60_000);
        let attempts = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let attempts = attempts.clone();
            let result: Result<()> = cb
                .call("quotes:NFO", || async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(Error::transient("quotes:NFO", "connection refused"))
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(cb.state("quotes:NFO"), BreakerState::Open);

        let counter = attempts.clone();
        let result: Result<()> = cb
            .call("quotes:NFO", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_reset_clears_key() {
        let cb = breaker(1, 60_000);
        cb.record_failure("orders:live");
        cb.reset("orders:live");
        assert_eq!(cb.state("orders:live"), BreakerState::Closed);
        assert!(cb.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_trial_reopens_circuit() {
        let cb = breaker(1, 20);
        let failed: Result<()> = cb
            .call("quotes:NFO", || async { Err(Error::transient("quotes:NFO", "timeout")) })
            .await;
        assert!(failed.is_err());
        tokio::time::sleep(Duration::from_millis(30)).await;

        let hung = tokio::time::timeout(
            Duration::from_millis(10),
            cb.call("quotes:NFO", || futures_util::future::pending::<Result<()>>()),
        )
        .await;
        assert!(hung.is_err());
        assert_eq!(cb.state("quotes:NFO"), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        cb.acquire("quotes:NFO").unwrap();
        assert_eq!(cb.state("quotes:NFO"), BreakerState::HalfOpen);
    }

    async fn decode(corrupt: bool) -> Result<()> {
        if corrupt {
            panic!("quote decoder blew up");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_panicking_call_counts_as_failure() {
        use futures_util::FutureExt;

        let cb = breaker(1, 60_000);
        let outcome = std::panic::AssertUnwindSafe(cb.call("quotes:NFO", || decode(true)))
            .catch_unwind()
            .await;
        assert!(outcome.is_err());
        assert_eq!(cb.state("quotes:NFO"), BreakerState::Open);
        assert_eq!(cb.consecutive_failures("quotes:NFO"), 1);
    }

    #[tokio::test]
    async fn test_unreported_trial_expires_after_cooldown() {
        let cb = breaker(1, 20);
        cb.acquire("orders:live").unwrap();
        cb.record_failure("orders:live");
        tokio::time::sleep(Duration::from_millis(30)).await;

        cb.acquire("orders:live").unwrap();
        assert!(cb.acquire("orders:live").is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        cb.acquire("orders:live").unwrap();
        assert_eq!(cb.state("orders:live"), BreakerState::HalfOpen);
    }
}
