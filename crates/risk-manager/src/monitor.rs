//! The risk manager: owns the caches, the feed listener and the monitoring
//! loop, and wires rule decisions to the exit engine.

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use options_core::api::{QuoteProvider, TickSource};
use options_core::config::RiskConfig;
use options_core::db::{PositionStore, StatusPatch};
use options_core::types::{BracketFill, Position, PositionStatus};
use options_core::{Error, Result};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use trading_engine::OrderRouter;
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::exit_engine::{ExitEngine, ExitOutcome};
use crate::metrics::{CycleStats, HealthReport, RiskMetrics};
use crate::pnl_cache::{PnlCache, PnlCacheConfig, SnapshotBackend};
use crate::position_cache::PositionCache;
use crate::rule_engine::{RuleContext, RuleEngine};
use crate::supervisor::Supervisor;
use crate::tick_listener::TickListener;
use crate::trailing::TrailingEngine;
use crate::underlying::UnderlyingSource;

/// External collaborators the risk manager is built from.
pub struct RiskComponents {
    pub store: Arc<dyn PositionStore>,
    pub router: Arc<dyn OrderRouter>,
    pub quotes: Arc<dyn QuoteProvider>,
    pub feed: Arc<dyn TickSource>,
    pub snapshots: Arc<dyn SnapshotBackend>,
    pub underlying: Arc<dyn UnderlyingSource>,
}

struct ReconcileGuard<'a>(&'a AtomicBool);

impl Drop for ReconcileGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RiskManager {
    config: RiskConfig,
    store: Arc<dyn PositionStore>,
    quotes: Arc<dyn QuoteProvider>,
    underlying: Arc<dyn UnderlyingSource>,
    cache: Arc<PositionCache>,
    pnl_cache: Arc<PnlCache>,
    breaker: Arc<CircuitBreaker>,
    listener: Arc<TickListener>,
    rules: RuleEngine,
    trailing: TrailingEngine,
    exits: ExitEngine,
    metrics: Arc<RiskMetrics>,
    supervisor: Arc<Supervisor>,
    started_at: Instant,
    started: AtomicBool,
    reconciling: AtomicBool,
    /// Milliseconds after `started_at` of the last reconciliation launch.
    last_reconcile_ms: AtomicU64,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reconcile_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, components: RiskComponents) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(RiskMetrics::new());
        let cache = Arc::new(PositionCache::new());
        let pnl_cache = Arc::new(PnlCache::new(
            components.snapshots,
            components.store.clone(),
            PnlCacheConfig::from(&config),
        ));
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from(&config)));
        let listener = Arc::new(TickListener::new(
            components.feed,
            cache.clone(),
            pnl_cache.clone(),
            metrics.clone(),
            config.pnl_flush_interval(),
        ));
        let rules = RuleEngine::standard(&config)?;
        let trailing = TrailingEngine::new(
            config.trailing_tier_table.clone(),
            components.store.clone(),
            components.router.clone(),
        );
        let exits = ExitEngine::new(
            cache.clone(),
            pnl_cache.clone(),
            components.store.clone(),
            components.router,
            breaker.clone(),
            listener.clone(),
            metrics.clone(),
        );
        let supervisor = Arc::new(Supervisor::new(
            config.supervisor_restart_delay(),
            config.shutdown_timeout(),
        ));
        let (shutdown, _) = watch::channel(false);

        info!(rules = ?rules.rule_names(), "Risk manager configured");

        Ok(Self {
            config,
            store: components.store,
            quotes: components.quotes,
            underlying: components.underlying,
            cache,
            pnl_cache,
            breaker,
            listener,
            rules,
            trailing,
            exits,
            metrics,
            supervisor,
            started_at: Instant::now(),
            started: AtomicBool::new(false),
            reconciling: AtomicBool::new(false),
            last_reconcile_ms: AtomicU64::new(0),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            reconcile_task: std::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<PositionCache> {
        &self.cache
    }

    pub fn pnl_cache(&self) -> &Arc<PnlCache> {
        &self.pnl_cache
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn listener(&self) -> &Arc<TickListener> {
        &self.listener
    }

    pub fn exits(&self) -> &ExitEngine {
        &self.exits
    }

    pub fn metrics(&self) -> &Arc<RiskMetrics> {
        &self.metrics
    }

    /// Recover open positions from the store and spawn the feed listener,
    /// the flush worker and the monitoring loop under supervision.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("Risk manager already started");
            return Ok(());
        }

        let recovered = self.recover().await?;
        info!(recovered, "Recovered open positions");

        let mut tasks = self.tasks.lock().await;

        let listener = self.listener.clone();
        tasks.push(self.spawn_supervised("tick_listener", move |shutdown| {
            let listener = listener.clone();
            async move { listener.run(shutdown).await.map_err(anyhow::Error::from) }
        }));

        let listener = self.listener.clone();
        tasks.push(self.spawn_supervised("pnl_flush", move |shutdown| {
            let listener = listener.clone();
            async move { listener.run_flush(shutdown).await.map_err(anyhow::Error::from) }
        }));

        let manager = self.clone();
        tasks.push(self.spawn_supervised("monitor", move |shutdown| {
            let manager = manager.clone();
            async move { manager.run_monitor(shutdown).await.map_err(anyhow::Error::from) }
        }));

        info!("Risk manager started");
        Ok(())
    }

    fn spawn_supervised<F, Fut>(&self, name: &'static str, factory: F) -> JoinHandle<()>
    where
        F: FnMut(watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let supervisor = self.supervisor.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { supervisor.supervise(name, factory, shutdown).await })
    }

    /// Signal shutdown and join workers for at most `timeout`, aborting any
    /// that miss it.
    pub async fn stop(&self, timeout: Duration) {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
        let deadline = tokio::time::Instant::now() + timeout;

        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Worker did not stop in time, aborting");
                handle.abort();
            }
        }
        if let Some(handle) = self.take_reconcile_task() {
            handle.abort();
        }
        self.metrics.set_running(false);
        info!("Risk manager stopped");
    }

    async fn recover(&self) -> Result<usize> {
        let positions = self.store.list_active().await?;
        let mut recovered = 0;
        for mut position in positions {
            if position.status == PositionStatus::Exiting {
                // An exit that never confirmed goes back to the rules.
                let reverted = self
                    .store
                    .transition_status(
                        position.id,
                        PositionStatus::Exiting,
                        PositionStatus::Active,
                        StatusPatch::default(),
                    )
                    .await?;
                if !reverted {
                    continue;
                }
                position.revert_exit()?;
                warn!(position_id = %position.id, "Reverted unconfirmed exit on startup");
            }
            self.track(position).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Subscribe and cache a position the store already holds.
    async fn track(&self, mut position: Position) -> Result<()> {
        match self.pnl_cache.fetch(position.id).await {
            Ok(Some(snapshot)) => position.apply_snapshot(&snapshot)?,
            Ok(None) => {}
            Err(e) => warn!(position_id = %position.id, error = %e, "PnL cache read failed"),
        }
        self.listener.subscribe(position.instrument_id());
        let snapshot = position.snapshot();
        self.cache.add(position)?;
        if let Err(e) = self.pnl_cache.store(&snapshot).await {
            warn!(position_id = %snapshot.position_id, error = %e, "Failed to seed PnL cache");
        }
        Ok(())
    }

    /// Take over a newly opened position: persist, subscribe, then cache.
    pub async fn register_position(&self, mut position: Position) -> Result<()> {
        if position.status == PositionStatus::Pending {
            position.activate()?;
        }
        if position.status != PositionStatus::Active {
            return Err(Error::Validation(format!(
                "cannot register {} position {}",
                position.status.as_str(),
                position.id
            )));
        }
        if position.entry_price <= Decimal::ZERO || position.quantity <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "position {} needs a positive entry price and quantity",
                position.id
            )));
        }

        self.store.create(&position).await?;
        self.listener.subscribe(position.instrument_id());
        let snapshot = position.snapshot();
        info!(
            position_id = %position.id,
            instrument_id = %position.instrument.instrument_id,
            side = ?position.side,
            quantity = %position.quantity,
            entry_price = %position.entry_price,
            "Position registered"
        );
        self.cache.add(position)?;
        if let Err(e) = self.pnl_cache.store(&snapshot).await {
            warn!(position_id = %snapshot.position_id, error = %e, "Failed to seed PnL cache");
        }
        Ok(())
    }

    /// Record a broker-side bracket fill; the next cycle closes the position
    /// at that price.
    pub fn publish_bracket_fill(&self, position_id: Uuid, fill: BracketFill) -> bool {
        let recorded = self.cache.mark_bracket_filled(position_id, fill.clone());
        if recorded {
            info!(position_id = %position_id, leg = ?fill.leg, price = %fill.price, "Bracket leg filled");
        } else {
            warn!(position_id = %position_id, "Bracket fill for unknown position");
        }
        recorded
    }

    async fn run_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.metrics.set_running(true);
        info!("Monitoring loop running");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.run_cycle().await {
                warn!(error = %e, "Monitoring cycle failed");
                self.metrics.record_error(Utc::now());
            }
            self.maybe_reconcile();

            let interval = self.config.cycle_interval(self.cache.active_count() > 0);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.metrics.set_running(false);
        info!("Monitoring loop stopped");
        Ok(())
    }

    /// One pass over every live position.
    ///
    /// Rules see the copy of each position taken at the start of the cycle,
    /// brought up to date from the snapshot cache or the quote fallback.
    /// Ticks landing mid-cycle are picked up on the next pass.
    pub async fn run_cycle(&self) -> Result<CycleStats> {
        let started = Instant::now();
        let now = Utc::now();
        let mut positions = self.cache.snapshot_all();
        let mut stats = CycleStats {
            positions: positions.len(),
            ..Default::default()
        };

        let mut stale = Vec::new();
        for (idx, position) in positions.iter_mut().enumerate() {
            match self.resolve_cached(position, now).await {
                Ok(()) => stats.cache_hits += 1,
                Err(Error::Stale { position_id, age }) => {
                    debug!(position_id = %position_id, age_ms = age.as_millis() as u64, "PnL stale, falling back to quotes");
                    stale.push(idx);
                }
                Err(e) => {
                    warn!(position_id = %position.id, error = %e, "PnL cache read failed");
                    self.metrics.record_error(now);
                    stale.push(idx);
                }
            }
        }
        if !stale.is_empty() {
            self.fetch_fallback(&mut positions, &stale, now, &mut stats).await;
        }

        for position in positions {
            let id = position.id;
            let outcome = AssertUnwindSafe(self.process_position(position, now))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(Some(ExitOutcome::Exited { .. }))) => stats.exits += 1,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    stats.errors += 1;
                    self.metrics.position_errors.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_error(now);
                    warn!(position_id = %id, error = %e, "Position processing failed");
                }
                Err(_) => {
                    stats.errors += 1;
                    self.metrics.position_errors.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_error(now);
                    error!(position_id = %id, "Position processing panicked");
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        stats.positions = self.cache.active_count();
        self.metrics.record_cycle(duration_ms, &stats);
        debug!(
            duration_ms,
            positions = stats.positions,
            cache_hits = stats.cache_hits,
            api_calls = stats.api_calls,
            stale = stats.stale,
            exits = stats.exits,
            "Cycle complete"
        );
        Ok(stats)
    }

    /// Bring the cycle's copy up to date from the shared snapshot or its own
    /// last tick. `Err(Stale)` when neither is fresh.
    async fn resolve_cached(&self, position: &mut Position, now: DateTime<Utc>) -> Result<()> {
        if let Some(snapshot) = self.pnl_cache.fetch_fresh(position.id, now).await? {
            position.apply_snapshot(&snapshot)?;
            self.cache
                .update_with(position.id, |p| p.apply_snapshot(&snapshot))
                .transpose()?;
            return Ok(());
        }

        let age = (now - position.last_price_at).to_std().unwrap_or_default();
        if age <= self.pnl_cache.staleness_threshold() {
            return Ok(());
        }
        Err(Error::Stale {
            position_id: position.id,
            age,
        })
    }

    /// Price the stale copies in `positions` through the quote API, one
    /// breaker-guarded batch per segment. Positions still unpriced keep their
    /// last value.
    async fn fetch_fallback(
        &self,
        positions: &mut [Position],
        stale: &[usize],
        now: DateTime<Utc>,
        stats: &mut CycleStats,
    ) {
        let mut by_segment: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for &idx in stale {
            let instrument = &positions[idx].instrument;
            let instruments = by_segment.entry(instrument.segment.clone()).or_default();
            if !instruments.contains(&instrument.instrument_id) {
                instruments.push(instrument.instrument_id.clone());
            }
        }

        let mut priced: HashMap<String, Decimal> = HashMap::new();
        for (segment, instruments) in by_segment {
            let key = format!("quotes:{segment}");
            let result = self
                .breaker
                .call(&key, || self.quotes.ltp_batch(&segment, &instruments))
                .await;

            match result {
                Ok(prices) => {
                    stats.api_calls += 1;
                    for (instrument_id, price) in prices {
                        for id in self.cache.update_price(&instrument_id, price, now) {
                            if let Some(position) = self.cache.get(id) {
                                if let Err(e) = self.pnl_cache.store(&position.snapshot()).await {
                                    warn!(position_id = %id, error = %e, "Failed to cache fallback PnL");
                                }
                            }
                        }
                        priced.insert(instrument_id, price);
                    }
                }
                Err(Error::CircuitOpen { .. }) => {
                    debug!(key = %key, "Quote fallback skipped, circuit open");
                }
                Err(e) => {
                    stats.api_calls += 1;
                    if e.is_transient() {
                        debug!(key = %key, error = %e, "Quote fallback failed, will retry");
                    } else {
                        warn!(key = %key, error = %e, "Quote fallback failed");
                    }
                    self.metrics.record_error(now);
                }
            }
        }

        for &idx in stale {
            let position = &mut positions[idx];
            match priced.get(&position.instrument.instrument_id) {
                Some(&price) => {
                    if let Err(e) = position.apply_price(price, now) {
                        warn!(position_id = %position.id, error = %e, "Rejected fallback price");
                    }
                }
                None => stats.stale += 1,
            }
        }
    }

    async fn process_position(
        &self,
        mut position: Position,
        now: DateTime<Utc>,
    ) -> Result<Option<ExitOutcome>> {
        let id = position.id;
        match self
            .trailing
            .apply(&self.cache, &self.pnl_cache, &mut position)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(position_id = %id, error = %e, "Trailing update failed");
                self.metrics.record_error(now);
            }
        }
        if position.status != PositionStatus::Active || !self.cache.contains(id) {
            return Ok(None);
        }

        let underlying = position
            .instrument
            .underlying_id
            .as_deref()
            .and_then(|u| self.underlying.underlying_state(u));
        let ctx = RuleContext::new(&position, &self.config, now, underlying.as_ref());
        let evaluation = self.rules.evaluate(&ctx);
        if evaluation.errors > 0 {
            self.metrics
                .rule_errors
                .fetch_add(u64::from(evaluation.errors), Ordering::Relaxed);
        }

        let Some(signal) = evaluation.exit_signal().cloned() else {
            return Ok(None);
        };
        info!(
            position_id = %id,
            rule = %signal.rule,
            reason = %signal.reason,
            "Exit triggered"
        );
        self.exits.execute(&position, &signal).await.map(Some)
    }

    fn maybe_reconcile(self: &Arc<Self>) {
        let elapsed_ms = self.started_at.elapsed().as_millis() as u64;
        let last = self.last_reconcile_ms.load(Ordering::Acquire);
        let interval_ms = self.config.reconcile_interval().as_millis() as u64;
        if elapsed_ms.saturating_sub(last) < interval_ms || self.reconciling.load(Ordering::Acquire) {
            return;
        }
        self.last_reconcile_ms.store(elapsed_ms, Ordering::Release);
        self.spawn_reconcile();
    }

    /// Run a reconciliation in the background. `stop` aborts it.
    fn spawn_reconcile(self: &Arc<Self>) {
        if *self.shutdown.borrow() {
            return;
        }
        let mut slot = self
            .reconcile_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.as_ref().is_some_and(|running| !running.is_finished()) {
            debug!("Previous reconciliation still running");
            return;
        }
        let manager = self.clone();
        *slot = Some(tokio::spawn(async move {
            if let Err(e) = manager.reconcile().await {
                warn!(error = %e, "Reconciliation failed");
                manager.metrics.record_error(Utc::now());
            }
        }));
    }

    fn take_reconcile_task(&self) -> Option<JoinHandle<()>> {
        self.reconcile_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Self-heal the caches against the durable store: re-track active
    /// positions the hot path lost and drop ones the store has closed.
    /// Overlapping calls return immediately. Returns positions repaired.
    pub async fn reconcile(&self) -> Result<usize> {
        if self
            .reconciling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Reconciliation already running");
            return Ok(0);
        }
        let _guard = ReconcileGuard(&self.reconciling);
        self.metrics.reconcile_runs.fetch_add(1, Ordering::Relaxed);

        let recorded = self.exits.retry_unrecorded().await;
        if recorded > 0 {
            info!(recorded, "Recorded previously failed exits");
        }

        let active = self.store.list_active().await?;
        let mut active_ids = HashSet::with_capacity(active.len());
        let mut repaired = 0;

        for position in active {
            active_ids.insert(position.id);
            if position.status != PositionStatus::Active {
                continue;
            }
            let id = position.id;
            let instrument_id = position.instrument.instrument_id.clone();
            let mut fixed = false;

            if !self.cache.contains(id) {
                warn!(position_id = %id, "Active position missing from hot cache, re-adding");
                self.track(position).await?;
                fixed = true;
            } else if self.pnl_cache.fetch(id).await?.is_none() {
                if let Some(cached) = self.cache.get(id) {
                    self.pnl_cache.store(&cached.snapshot()).await?;
                    debug!(position_id = %id, "Re-seeded PnL cache");
                    fixed = true;
                }
            }

            if !self.listener.is_subscribed(&instrument_id) {
                warn!(position_id = %id, instrument_id = %instrument_id, "Instrument unsubscribed, resubscribing");
                self.listener.subscribe(&instrument_id);
                fixed = true;
            }

            if fixed {
                repaired += 1;
            }
        }

        for cached in self.cache.snapshot_all() {
            if active_ids.contains(&cached.id) {
                continue;
            }
            if let Some(stored) = self.store.get(cached.id).await? {
                if stored.is_terminal() {
                    info!(position_id = %cached.id, status = stored.status.as_str(), "Dropping position closed elsewhere");
                    self.cache.remove(cached.id);
                    self.pnl_cache.evict(cached.id).await?;
                }
            }
        }

        self.metrics
            .reconciled_positions
            .fetch_add(repaired as u64, Ordering::Relaxed);
        if repaired > 0 {
            info!(repaired, "Reconciliation repaired positions");
        }
        Ok(repaired)
    }

    pub fn health(&self) -> HealthReport {
        let now = Utc::now();
        HealthReport {
            running: self.metrics.is_running(),
            last_cycle_duration_ms: self.metrics.last_cycle_duration_ms.load(Ordering::Relaxed),
            active_position_count: self.cache.active_count() as u64,
            circuit_breaker_state: self.breaker.overall_state().as_str().to_string(),
            circuit_breakers: self.breaker.snapshot(),
            recent_error_count: self.metrics.recent_errors(now),
            uptime_secs: self.started_at.elapsed().as_secs(),
            cycles: self.metrics.cycles.load(Ordering::Relaxed),
            exits_executed: self.metrics.exits_executed.load(Ordering::Relaxed),
            exit_failures: self.metrics.exit_failures.load(Ordering::Relaxed),
            stale_pnl_reads: self.metrics.stale_pnl_reads.load(Ordering::Relaxed),
            api_calls: self.metrics.api_calls.load(Ordering::Relaxed),
            cache_hits: self.metrics.cache_hits.load(Ordering::Relaxed),
            rule_errors: self.rules.error_count(),
            supervisor_restarts: self.supervisor.restarts(),
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerState;
    use crate::pnl_cache::MemoryBackend;
    use crate::underlying::UnderlyingBoard;
    use async_trait::async_trait;
    use futures_util::stream;
    use mockall::mock;
    use options_core::api::TickStream;
    use options_core::db::MemoryPositionStore;
    use options_core::types::{
        BracketLeg, Instrument, OptionKind, PnlSnapshot, PositionSide, UnderlyingState,
    };
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::OnceLock;
    use trading_engine::OrderExecutor;

    mock! {
        Quotes {}

        #[async_trait]
        impl QuoteProvider for Quotes {
            async fn ltp_batch(
                &self,
                segment: &str,
                instrument_ids: &[String],
            ) -> Result<HashMap<String, Decimal>>;
        }
    }

    struct SilentFeed;

    #[async_trait]
    impl TickSource for SilentFeed {
        async fn open(&self, _instruments: &[String]) -> Result<TickStream> {
            Ok(Box::pin(stream::pending()))
        }
    }

    fn config() -> RiskConfig {
        RiskConfig {
            sl_pct: Decimal::new(2, 0),
            tp_pct: Decimal::new(5, 0),
            session_close_at: None,
            cycle_interval_active_ms: 20,
            cycle_interval_idle_ms: 20,
            supervisor_restart_delay_ms: 10,
            shutdown_timeout_secs: 1,
            ..RiskConfig::default()
        }
    }

    fn manager(quotes: MockQuotes) -> (Arc<RiskManager>, Arc<MemoryPositionStore>) {
        let store = Arc::new(MemoryPositionStore::new());
        let manager = manager_with(
            Arc::new(quotes),
            store.clone(),
            Arc::new(UnderlyingBoard::new()),
        );
        (manager, store)
    }

    fn manager_with(
        quotes: Arc<dyn QuoteProvider>,
        store: Arc<dyn PositionStore>,
        underlying: Arc<dyn UnderlyingSource>,
    ) -> Arc<RiskManager> {
        let components = RiskComponents {
            store,
            router: Arc::new(OrderExecutor::paper().unwrap()),
            quotes,
            feed: Arc::new(SilentFeed),
            snapshots: Arc::new(MemoryBackend::new()),
            underlying,
        };
        Arc::new(RiskManager::new(config(), components).unwrap())
    }

    /// Moves another instrument's price while the cycle evaluates a position.
    struct TickDuringEvaluation {
        cache: OnceLock<Arc<PositionCache>>,
        instrument_id: &'static str,
        price: Decimal,
    }

    impl UnderlyingSource for TickDuringEvaluation {
        fn underlying_state(&self, _underlying_id: &str) -> Option<UnderlyingState> {
            if let Some(cache) = self.cache.get() {
                cache.update_price(self.instrument_id, self.price, Utc::now());
            }
            None
        }
    }

    /// Panics on its first batch, then quotes every instrument at 100.
    #[derive(Default)]
    struct PanicOnceQuotes {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl QuoteProvider for PanicOnceQuotes {
        async fn ltp_batch(
            &self,
            _segment: &str,
            instrument_ids: &[String],
        ) -> Result<HashMap<String, Decimal>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("malformed quote payload");
            }
            Ok(instrument_ids
                .iter()
                .map(|id| (id.clone(), Decimal::new(100, 0)))
                .collect())
        }
    }

    /// Memory store whose `list_active` hangs.
    struct HangingStore {
        inner: MemoryPositionStore,
    }

    #[async_trait]
    impl PositionStore for HangingStore {
        async fn create(&self, position: &Position) -> Result<()> {
            self.inner.create(position).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<Position>> {
            self.inner.get(id).await
        }

        async fn list_active(&self) -> Result<Vec<Position>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.inner.list_active().await
        }

        async fn transition_status(
            &self,
            id: Uuid,
            from: PositionStatus,
            to: PositionStatus,
            patch: StatusPatch,
        ) -> Result<bool> {
            self.inner.transition_status(id, from, to, patch).await
        }

        async fn update_pnl(&self, snapshot: &PnlSnapshot) -> Result<()> {
            self.inner.update_pnl(snapshot).await
        }

        async fn update_stop(
            &self,
            id: Uuid,
            stop_price: Decimal,
            trailing_tier: Option<usize>,
        ) -> Result<()> {
            self.inner.update_stop(id, stop_price, trailing_tier).await
        }
    }

    fn position() -> Position {
        Position::new(
            Instrument::new("NFO", "43512", "NIFTY24MAY22500CE"),
            PositionSide::Long,
            Decimal::new(50, 0),
            Decimal::new(100, 0),
        )
    }

    fn stale_position() -> Position {
        let mut position = position();
        position.last_price_at = Utc::now() - chrono::Duration::seconds(120);
        position
    }

    #[tokio::test]
    async fn test_register_persists_subscribes_and_caches() {
        let (manager, store) = manager(MockQuotes::new());
        let position = position();
        manager.register_position(position.clone()).await.unwrap();

        let stored = store.get(position.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PositionStatus::Active);
        assert!(manager.listener().is_subscribed("43512"));
        assert!(manager.cache().contains(position.id));
        assert!(manager.pnl_cache().fetch(position.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_register_rejects_closed_position() {
        let (manager, _) = manager(MockQuotes::new());
        let mut position = position();
        position.cancel().unwrap();
        assert!(matches!(
            manager.register_position(position).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_loss_exit_through_cycle() {
        let (manager, store) = manager(MockQuotes::new());
        let position = position();
        manager.register_position(position.clone()).await.unwrap();

        manager
            .cache()
            .update_price("43512", Decimal::new(96, 0), Utc::now());
        let stats = manager.run_cycle().await.unwrap();

        assert_eq!(stats.exits, 1);
        let stored = store.get(position.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PositionStatus::Exited);
        assert!(stored.exit_reason.unwrap().contains("-4.00%"));
        assert!(!manager.cache().contains(position.id));
    }

    #[tokio::test]
    async fn test_fallback_prices_stale_position() {
        let mut quotes = MockQuotes::new();
        quotes
            .expect_ltp_batch()
            .times(1)
            .returning(|_, ids| {
                Ok(ids
                    .iter()
                    .map(|id| (id.clone(), Decimal::new(101, 0)))
                    .collect())
            });
        let (manager, _) = manager(quotes);
        let position = stale_position();
        manager.register_position(position.clone()).await.unwrap();

        let stats = manager.run_cycle().await.unwrap();
        assert_eq!(stats.api_calls, 1);
        assert_eq!(stats.stale, 0);
        assert_eq!(
            manager.cache().get(position.id).unwrap().current_price,
            Decimal::new(101, 0)
        );

        // Now fresh: no further quote calls.
        let stats = manager.run_cycle().await.unwrap();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.api_calls, 0);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_ten_fallback_failures() {
        let mut quotes = MockQuotes::new();
        quotes
            .expect_ltp_batch()
            .times(10)
            .returning(|_, _| Err(Error::transient("quotes:NFO", "connection reset")));
        let (manager, _) = manager(quotes);
        manager.register_position(stale_position()).await.unwrap();

        for _ in 0..10 {
            let stats = manager.run_cycle().await.unwrap();
            assert_eq!(stats.stale, 1);
        }
        assert_eq!(manager.breaker().state("quotes:NFO"), BreakerState::Open);

        let stats = manager.run_cycle().await.unwrap();
        assert_eq!(stats.api_calls, 0);
        assert_eq!(stats.stale, 1);
        assert_eq!(manager.health().circuit_breaker_state, "open");
        assert_eq!(manager.health().stale_pnl_reads, 11);
    }

    #[tokio::test]
    async fn test_reconcile_readds_missing_position() {
        let (manager, _) = manager(MockQuotes::new());
        let position = position();
        manager.register_position(position.clone()).await.unwrap();

        manager.cache().remove(position.id);
        manager.pnl_cache().evict(position.id).await.unwrap();
        manager.listener().unsubscribe("43512");

        assert_eq!(manager.reconcile().await.unwrap(), 1);
        assert!(manager.cache().contains(position.id));
        assert!(manager.listener().is_subscribed("43512"));
        assert!(manager.pnl_cache().fetch(position.id).await.unwrap().is_some());

        assert_eq!(manager.reconcile().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_drops_positions_closed_elsewhere() {
        let (manager, store) = manager(MockQuotes::new());
        let position = position();
        manager.register_position(position.clone()).await.unwrap();
        store
            .transition_status(
                position.id,
                PositionStatus::Active,
                PositionStatus::Exited,
                StatusPatch::default(),
            )
            .await
            .unwrap();

        manager.reconcile().await.unwrap();
        assert!(!manager.cache().contains(position.id));
    }

    #[tokio::test]
    async fn test_bracket_fill_closes_on_next_cycle() {
        let (manager, store) = manager(MockQuotes::new());
        let position = position();
        manager.register_position(position.clone()).await.unwrap();

        assert!(manager.publish_bracket_fill(
            position.id,
            BracketFill {
                leg: BracketLeg::Target,
                price: Decimal::new(104, 0),
                filled_at: Utc::now(),
            },
        ));
        manager.run_cycle().await.unwrap();

        let stored = store.get(position.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PositionStatus::Exited);
        assert_eq!(stored.exit_price, Some(Decimal::new(104, 0)));
        assert!(!manager.publish_bracket_fill(
            Uuid::new_v4(),
            BracketFill {
                leg: BracketLeg::Target,
                price: Decimal::new(104, 0),
                filled_at: Utc::now(),
            },
        ));
    }

    #[tokio::test]
    async fn test_start_recovers_and_stop_joins() {
        let (manager, store) = manager(MockQuotes::new());
        let mut recovered = position();
        recovered.activate().unwrap();
        store.create(&recovered).await.unwrap();

        manager.start().await.unwrap();
        assert!(manager.cache().contains(recovered.id));
        tokio::time::sleep(Duration::from_millis(80)).await;

        let health = manager.health();
        assert!(health.running);
        assert!(health.cycles >= 1);
        assert_eq!(health.active_position_count, 1);

        manager.stop(Duration::from_secs(1)).await;
        assert!(!manager.health().running);
    }

    #[tokio::test]
    async fn test_unconfirmed_exit_reverted_on_start() {
        let (manager, store) = manager(MockQuotes::new());
        let mut stuck = position();
        stuck.activate().unwrap();
        stuck.begin_exit().unwrap();
        store.create(&stuck).await.unwrap();

        manager.start().await.unwrap();
        assert_eq!(
            manager.cache().get(stuck.id).unwrap().status,
            PositionStatus::Active
        );
        assert_eq!(
            store.get(stuck.id).await.unwrap().unwrap().status,
            PositionStatus::Active
        );
        manager.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_rules_see_prices_from_cycle_start() {
        let store = Arc::new(MemoryPositionStore::new());
        let ticker = Arc::new(TickDuringEvaluation {
            cache: OnceLock::new(),
            instrument_id: "43600",
            price: Decimal::new(96, 0),
        });
        let manager = manager_with(Arc::new(MockQuotes::new()), store.clone(), ticker.clone());
        assert!(ticker.cache.set(manager.cache().clone()).is_ok());

        let first = Position::new(
            Instrument::new("NFO", "43512", "NIFTY24MAY22500CE").option(OptionKind::Call, "NIFTY"),
            PositionSide::Long,
            Decimal::new(50, 0),
            Decimal::new(100, 0),
        );
        let mut second = Position::new(
            Instrument::new("NFO", "43600", "NIFTY24MAY22600CE"),
            PositionSide::Long,
            Decimal::new(50, 0),
            Decimal::new(100, 0),
        );
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        manager.register_position(first.clone()).await.unwrap();
        manager.register_position(second.clone()).await.unwrap();

        // The tick on the second instrument lands while the first is evaluated.
        let stats = manager.run_cycle().await.unwrap();
        assert_eq!(stats.exits, 0);
        assert_eq!(
            store.get(second.id).await.unwrap().unwrap().status,
            PositionStatus::Active
        );
        let cached = manager.cache().get(second.id).unwrap();
        assert_eq!(cached.current_price, Decimal::new(96, 0));

        // Evaluated on the following pass.
        let stats = manager.run_cycle().await.unwrap();
        assert_eq!(stats.exits, 1);
        assert_eq!(
            store.get(second.id).await.unwrap().unwrap().status,
            PositionStatus::Exited
        );
        assert!(manager.cache().contains(first.id));
    }

    #[tokio::test]
    async fn test_monitor_restarts_after_panicking_cycle() {
        let quotes = Arc::new(PanicOnceQuotes::default());
        let store = Arc::new(MemoryPositionStore::new());
        let manager = manager_with(quotes.clone(), store, Arc::new(UnderlyingBoard::new()));
        let position = stale_position();
        manager.register_position(position.clone()).await.unwrap();

        manager.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let health = manager.health();
        assert!(health.supervisor_restarts >= 1);
        assert!(health.running);
        assert!(quotes.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(
            manager.cache().get(position.id).unwrap().current_price,
            Decimal::new(100, 0)
        );
        // The abandoned batch counted against the quote circuit.
        assert!(manager.breaker().snapshot()[0].last_failure_at.is_some());

        manager.stop(Duration::from_secs(1)).await;
        assert!(!manager.health().running);
    }

    #[tokio::test]
    async fn test_stop_aborts_running_reconciliation() {
        let store = Arc::new(HangingStore {
            inner: MemoryPositionStore::new(),
        });
        let manager = manager_with(
            Arc::new(MockQuotes::new()),
            store,
            Arc::new(UnderlyingBoard::new()),
        );

        manager.spawn_reconcile();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.reconciling.load(Ordering::Acquire));

        manager.stop(Duration::from_millis(100)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!manager.reconciling.load(Ordering::Acquire));
        assert!(manager.take_reconcile_task().is_none());

        // No new reconciliations once stopped.
        manager.spawn_reconcile();
        assert!(manager.take_reconcile_task().is_none());
    }
}
