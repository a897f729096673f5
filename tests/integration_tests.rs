//! Integration tests for component interactions.
//!
//! These tests drive the risk manager end to end over in-memory stores,
//! scripted routers and quote providers.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::stream;
use options_core::api::{QuoteProvider, TickSource, TickStream};
use options_core::config::RiskConfig;
use options_core::db::{MemoryPositionStore, PositionStore};
use options_core::types::{
    ExitOrder, Instrument, OrderConfirmation, Position, PositionSide, PositionStatus,
    StopModification,
};
use options_core::{Error, Result};
use risk_manager::{
    BreakerState, ExitOutcome, ExitSignal, MemoryBackend, RiskComponents, RiskManager,
    RuleContext, RuleEngine, Supervisor, UnderlyingBoard,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};
use trading_engine::{OrderExecutor, OrderRouter};

struct SilentFeed;

#[async_trait]
impl TickSource for SilentFeed {
    async fn open(&self, _instruments: &[String]) -> Result<TickStream> {
        Ok(Box::pin(stream::pending()))
    }
}

/// Quote provider that always fails and counts the calls that reach it.
#[derive(Default)]
struct DownQuotes {
    calls: AtomicUsize,
}

#[async_trait]
impl QuoteProvider for DownQuotes {
    async fn ltp_batch(
        &self,
        segment: &str,
        _instrument_ids: &[String],
    ) -> Result<HashMap<String, Decimal>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::transient(format!("quotes:{segment}"), "503 Service Unavailable"))
    }
}

/// Router that fails the first submission, then fills at the reference price.
#[derive(Default)]
struct FlakyRouter {
    submissions: AtomicUsize,
    failed_once: AtomicBool,
}

#[async_trait]
impl OrderRouter for FlakyRouter {
    async fn submit_exit(&self, order: &ExitOrder) -> Result<OrderConfirmation> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(Error::transient("orders:paper", "connection reset"));
        }
        Ok(OrderConfirmation::filled(
            order.id,
            None,
            order.quantity,
            order.reference_price,
        ))
    }

    async fn modify_stop(&self, _modification: &StopModification) -> Result<()> {
        Ok(())
    }

    fn is_live(&self) -> bool {
        false
    }
}

fn risk_config() -> RiskConfig {
    RiskConfig {
        sl_pct: Decimal::new(2, 0),
        tp_pct: Decimal::new(5, 0),
        session_close_at: None,
        ..RiskConfig::default()
    }
}

fn build(
    store: Arc<MemoryPositionStore>,
    router: Arc<dyn OrderRouter>,
    quotes: Arc<dyn QuoteProvider>,
) -> Arc<RiskManager> {
    let components = RiskComponents {
        store,
        router,
        quotes,
        feed: Arc::new(SilentFeed),
        snapshots: Arc::new(MemoryBackend::new()),
        underlying: Arc::new(UnderlyingBoard::new()),
    };
    Arc::new(RiskManager::new(risk_config(), components).unwrap())
}

fn paper_manager() -> (Arc<RiskManager>, Arc<MemoryPositionStore>) {
    let store = Arc::new(MemoryPositionStore::new());
    let manager = build(
        store.clone(),
        Arc::new(OrderExecutor::paper().unwrap()),
        Arc::new(DownQuotes::default()),
    );
    (manager, store)
}

fn long_call() -> Position {
    Position::new(
        Instrument::new("NFO", "43512", "NIFTY24MAY22500CE"),
        PositionSide::Long,
        Decimal::new(50, 0),
        Decimal::new(100, 0),
    )
}

/// Entry 100, stop-loss 2%, price 96: exits with a -4.00% reason.
#[tokio::test]
async fn test_stop_loss_closes_position() {
    let (manager, store) = paper_manager();
    let position = long_call();
    assert_ok!(manager.register_position(position.clone()).await);

    manager
        .cache()
        .update_price("43512", Decimal::new(96, 0), Utc::now());
    let stats = assert_ok!(manager.run_cycle().await);
    assert_eq!(stats.exits, 1);

    let stored = store.get(position.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PositionStatus::Exited);
    assert_eq!(stored.exit_price, Some(Decimal::new(96, 0)));
    let reason = stored.exit_reason.unwrap();
    assert!(reason.contains("-4.00%"), "unexpected reason: {reason}");

    assert!(!manager.cache().contains(position.id));
    assert!(!manager.listener().is_subscribed("43512"));
    assert_eq!(manager.health().exits_executed, 1);
}

/// At 15:20 market time with a 15:30 close and a 15 minute buffer, the
/// session-end rule decides even though the stop-loss is also breached.
#[test]
fn test_session_end_precedes_stop_loss() {
    let config = RiskConfig {
        sl_pct: Decimal::new(2, 0),
        session_close_at: Some("15:30".to_string()),
        session_exit_buffer_mins: 15,
        market_utc_offset_mins: 330,
        ..RiskConfig::default()
    };
    let engine = RuleEngine::standard(&config).unwrap();

    let now = Utc.with_ymd_and_hms(2024, 5, 2, 9, 50, 0).unwrap();
    let mut position = long_call();
    position.activate().unwrap();
    position.apply_price(Decimal::new(96, 0), now).unwrap();

    let ctx = RuleContext::new(&position, &config, now, None);
    let evaluation = engine.evaluate(&ctx);
    assert_eq!(evaluation.deciding_rule, Some("session_end"));
    assert!(evaluation.exit_signal().unwrap().reason.starts_with("session end"));
}

/// Two racing exit attempts on one position submit exactly one order.
#[tokio::test]
async fn test_concurrent_exits_execute_once() {
    let store = Arc::new(MemoryPositionStore::new());
    let router = Arc::new(FlakyRouter::default());
    router.failed_once.store(true, Ordering::SeqCst);
    let manager = build(store.clone(), router.clone(), Arc::new(DownQuotes::default()));

    let position = long_call();
    manager.register_position(position.clone()).await.unwrap();
    let active = manager.cache().get(position.id).unwrap();
    let signal = ExitSignal::new("stop_loss", "manual race", serde_json::Value::Null);

    let (a, b) = tokio::join!(
        manager.exits().execute(&active, &signal),
        manager.exits().execute(&active, &signal),
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    let exited = outcomes
        .iter()
        .filter(|o| matches!(o, ExitOutcome::Exited { .. }))
        .count();

    assert_eq!(exited, 1);
    assert_eq!(router.submissions.load(Ordering::SeqCst), 1);
    assert_eq!(
        store.get(position.id).await.unwrap().unwrap().status,
        PositionStatus::Exited
    );
}

/// A failed exit leaves the position active; the next cycle closes it.
#[tokio::test]
async fn test_failed_exit_retried_next_cycle() {
    let store = Arc::new(MemoryPositionStore::new());
    let router = Arc::new(FlakyRouter::default());
    let manager = build(store.clone(), router.clone(), Arc::new(DownQuotes::default()));

    let position = long_call();
    manager.register_position(position.clone()).await.unwrap();
    manager
        .cache()
        .update_price("43512", Decimal::new(95, 0), Utc::now());

    let first = manager.run_cycle().await.unwrap();
    assert_eq!(first.exits, 0);
    assert_eq!(first.errors, 1);
    assert_eq!(
        manager.cache().get(position.id).unwrap().status,
        PositionStatus::Active
    );
    assert_eq!(
        store.get(position.id).await.unwrap().unwrap().status,
        PositionStatus::Active
    );
    assert_eq!(manager.health().exit_failures, 1);

    let second = manager.run_cycle().await.unwrap();
    assert_eq!(second.exits, 1);
    assert_eq!(router.submissions.load(Ordering::SeqCst), 2);
    assert_eq!(
        store.get(position.id).await.unwrap().unwrap().status,
        PositionStatus::Exited
    );
}

/// A position lost from the hot path is restored by reconciliation.
#[tokio::test]
async fn test_reconciliation_restores_lost_position() {
    let (manager, _) = paper_manager();
    let position = long_call();
    manager.register_position(position.clone()).await.unwrap();

    manager.cache().remove(position.id);
    manager.listener().unsubscribe("43512");

    let repaired = manager.reconcile().await.unwrap();
    assert_eq!(repaired, 1);
    assert!(manager.cache().contains(position.id));
    assert!(manager.listener().is_subscribed("43512"));
}

/// Ten failed fallback fetches open the segment's breaker; the eleventh
/// cycle is rejected without reaching the quote API.
#[tokio::test]
async fn test_quote_breaker_opens_after_ten_failures() {
    let store = Arc::new(MemoryPositionStore::new());
    let quotes = Arc::new(DownQuotes::default());
    let manager = build(
        store,
        Arc::new(OrderExecutor::paper().unwrap()),
        quotes.clone(),
    );

    let mut position = long_call();
    position.last_price_at = Utc::now() - chrono::Duration::seconds(120);
    manager.register_position(position).await.unwrap();

    for _ in 0..10 {
        manager.run_cycle().await.unwrap();
    }
    assert_eq!(quotes.calls.load(Ordering::SeqCst), 10);
    assert_eq!(manager.breaker().state("quotes:NFO"), BreakerState::Open);

    let stats = manager.run_cycle().await.unwrap();
    assert_eq!(stats.stale, 1);
    assert_eq!(quotes.calls.load(Ordering::SeqCst), 10);
    assert!(!manager.health().is_healthy());
}

/// A worker that panics is restarted by its supervisor.
#[tokio::test]
async fn test_supervisor_restarts_crashed_worker() {
    let supervisor = Arc::new(Supervisor::new(
        Duration::from_millis(10),
        Duration::from_millis(100),
    ));
    let runs = Arc::new(AtomicUsize::new(0));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = {
        let supervisor = supervisor.clone();
        let runs = runs.clone();
        tokio::spawn(async move {
            supervisor
                .supervise(
                    "crashy",
                    move |mut shutdown| {
                        let run = runs.fetch_add(1, Ordering::SeqCst);
                        async move {
                            if run == 0 {
                                panic!("feed handler crashed");
                            }
                            let _ = shutdown.wait_for(|stop| *stop).await;
                            Ok(())
                        }
                    },
                    shutdown_rx,
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(supervisor.restarts(), 1);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

/// Closed or malformed positions are refused at registration.
#[tokio::test]
async fn test_register_rejects_invalid_positions() {
    let (manager, store) = paper_manager();

    let mut cancelled = long_call();
    cancelled.cancel().unwrap();
    assert_err!(manager.register_position(cancelled.clone()).await);

    let zero_quantity = Position::new(
        Instrument::new("NFO", "43512", "NIFTY24MAY22500CE"),
        PositionSide::Long,
        Decimal::ZERO,
        Decimal::new(100, 0),
    );
    assert_err!(manager.register_position(zero_quantity).await);

    assert!(store.is_empty());
    assert!(manager.cache().is_empty());
}

/// Startup recovers open positions and the loop reports healthy.
#[tokio::test]
async fn test_start_and_stop() {
    let (manager, store) = paper_manager();
    let mut open = long_call();
    open.activate().unwrap();
    store.create(&open).await.unwrap();

    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let health = manager.health();
    assert!(health.running);
    assert_eq!(health.active_position_count, 1);
    assert!(manager.listener().is_subscribed("43512"));

    manager.stop(Duration::from_secs(2)).await;
    assert!(!manager.health().running);
}
