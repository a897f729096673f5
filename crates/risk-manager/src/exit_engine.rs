//! Exactly-once position exits.
//!
//! An exit is claimed by a compare-and-set on the cached status followed by
//! a conditional update in the durable store. Only the caller that wins both
//! reaches the order router.

use chrono::Utc;
use dashmap::DashMap;
use options_core::db::{PositionStore, StatusPatch};
use options_core::types::{ExitOrder, Position, PositionStatus};
use options_core::{Error, Result};
use rust_decimal::Decimal;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use trading_engine::OrderRouter;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreaker;
use crate::metrics::RiskMetrics;
use crate::pnl_cache::PnlCache;
use crate::position_cache::PositionCache;
use crate::rule_engine::ExitSignal;
use crate::tick_listener::TickListener;

/// Result of an exit attempt that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Exited {
        exit_price: Decimal,
        /// None when a broker bracket leg had already closed the position.
        order_id: Option<Uuid>,
    },
    /// Another caller owns this exit.
    AlreadyExiting,
}

pub struct ExitEngine {
    cache: Arc<PositionCache>,
    pnl_cache: Arc<PnlCache>,
    store: Arc<dyn PositionStore>,
    router: Arc<dyn OrderRouter>,
    breaker: Arc<CircuitBreaker>,
    listener: Arc<TickListener>,
    metrics: Arc<RiskMetrics>,
    /// Exits filled at the broker whose final store write failed.
    unrecorded: DashMap<Uuid, StatusPatch>,
}

impl ExitEngine {
    pub fn new(
        cache: Arc<PositionCache>,
        pnl_cache: Arc<PnlCache>,
        store: Arc<dyn PositionStore>,
        router: Arc<dyn OrderRouter>,
        breaker: Arc<CircuitBreaker>,
        listener: Arc<TickListener>,
        metrics: Arc<RiskMetrics>,
    ) -> Self {
        Self {
            cache,
            pnl_cache,
            store,
            router,
            breaker,
            listener,
            metrics,
            unrecorded: DashMap::new(),
        }
    }

    /// Close `position` for `signal`.
    pub async fn execute(&self, position: &Position, signal: &ExitSignal) -> Result<ExitOutcome> {
        let id = position.id;
        if !self.cache.contains(id) {
            return Err(Error::NotFound(id));
        }
        if !self.cache.try_begin_exit(id) {
            debug!(position_id = %id, "Exit already in progress");
            return Ok(ExitOutcome::AlreadyExiting);
        }

        match self
            .store
            .transition_status(id, PositionStatus::Active, PositionStatus::Exiting, StatusPatch::default())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.settle_lost_race(id).await;
                return Ok(ExitOutcome::AlreadyExiting);
            }
            Err(e) => {
                self.cache.revert_exit(id);
                self.metrics.record_error(Utc::now());
                return Err(e);
            }
        }

        let current = self.cache.get(id).unwrap_or_else(|| position.clone());
        let price = if current.current_price > Decimal::ZERO {
            current.current_price
        } else {
            position.current_price
        };

        if let Some(fill) = &current.bracket_fill {
            info!(
                position_id = %id,
                rule = %signal.rule,
                fill_price = %fill.price,
                "Recording exit filled by broker bracket"
            );
            self.complete(&current, signal, fill.price, None).await?;
            return Ok(ExitOutcome::Exited {
                exit_price: fill.price,
                order_id: None,
            });
        }

        let order = ExitOrder::for_position(&current, price);
        let breaker_key = self.router.breaker_key();
        let submitted = match self.router.submit_exit(&order).await {
            Ok(confirmation) if confirmation.is_success() => Ok(confirmation),
            Ok(confirmation) => Err(Error::Order {
                message: confirmation
                    .error
                    .unwrap_or_else(|| "exit order rejected".to_string()),
            }),
            Err(e) => Err(e),
        };

        match submitted {
            Ok(confirmation) => {
                self.breaker.record_success(breaker_key);
                let exit_price = confirmation.average_price.unwrap_or(price);
                self.complete(&current, signal, exit_price, Some(order.id)).await?;
                Ok(ExitOutcome::Exited {
                    exit_price,
                    order_id: Some(order.id),
                })
            }
            Err(e) => {
                error!(
                    position_id = %id,
                    rule = %signal.rule,
                    error = %e,
                    "Exit submission failed, position stays active"
                );
                self.breaker.record_failure(breaker_key);
                self.metrics.record_exit_failure(Utc::now());
                self.revert(id).await;
                Err(e)
            }
        }
    }

    /// Positions closed at the broker but not yet recorded as exited.
    pub fn unrecorded_count(&self) -> usize {
        self.unrecorded.len()
    }

    /// Retry the final store write for exits that filled but failed to
    /// record. Returns how many were recorded.
    ///
    /// An exit stays pending until the store shows the position as exited.
    pub async fn retry_unrecorded(&self) -> usize {
        let pending: Vec<(Uuid, StatusPatch)> = self
            .unrecorded
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut recorded = 0;
        for (id, patch) in pending {
            match self.record_pending(id, patch).await {
                Ok(true) => {
                    self.unrecorded.remove(&id);
                    self.release(id).await;
                    recorded += 1;
                }
                Ok(false) => {
                    debug!(position_id = %id, "Exit already recorded elsewhere");
                    self.unrecorded.remove(&id);
                    self.release(id).await;
                }
                Err(e) => warn!(position_id = %id, error = %e, "Exit still unrecorded"),
            }
        }
        recorded
    }

    /// `Ok(true)` when this call recorded the exit, `Ok(false)` when the
    /// store already shows it exited.
    async fn record_pending(&self, id: Uuid, patch: StatusPatch) -> Result<bool> {
        if self
            .store
            .transition_status(id, PositionStatus::Exiting, PositionStatus::Exited, patch)
            .await?
        {
            return Ok(true);
        }
        match self.store.get(id).await? {
            Some(stored) if stored.status == PositionStatus::Exited => Ok(false),
            Some(_) => Err(Error::Conflict { position_id: id }),
            None => Err(Error::NotFound(id)),
        }
    }

    async fn complete(
        &self,
        position: &Position,
        signal: &ExitSignal,
        exit_price: Decimal,
        order_id: Option<Uuid>,
    ) -> Result<()> {
        let id = position.id;
        let now = Utc::now();
        let patch = StatusPatch::exit(exit_price, signal.reason.clone(), now);

        self.metrics.exits_executed.fetch_add(1, Ordering::Relaxed);
        info!(
            position_id = %id,
            instrument_id = %position.instrument.instrument_id,
            rule = %signal.rule,
            reason = %signal.reason,
            exit_price = %exit_price,
            pnl_pct = %position.pnl_pct,
            order_id = ?order_id,
            "Position exited"
        );

        if let Err(e) = self
            .store
            .transition_status(id, PositionStatus::Exiting, PositionStatus::Exited, patch.clone())
            .await
        {
            // The order is filled; keep the position out of rule evaluation
            // until the record lands.
            error!(position_id = %id, error = %e, "Failed to record exit");
            self.unrecorded.insert(id, patch);
            self.metrics.record_error(now);
            return Err(e);
        }

        self.release(id).await;
        Ok(())
    }

    /// Drop an exited position from the caches and the feed.
    async fn release(&self, id: Uuid) {
        let Some(position) = self.cache.remove(id) else {
            return;
        };
        if let Err(e) = self.pnl_cache.evict(id).await {
            warn!(position_id = %id, error = %e, "Failed to evict PnL snapshot");
        }
        let instrument_id = &position.instrument.instrument_id;
        if !self.cache.has_instrument(instrument_id) {
            self.listener.unsubscribe(instrument_id);
        }
    }

    async fn revert(&self, id: Uuid) {
        self.cache.revert_exit(id);
        if let Err(e) = self
            .store
            .transition_status(id, PositionStatus::Exiting, PositionStatus::Active, StatusPatch::default())
            .await
        {
            warn!(position_id = %id, error = %e, "Failed to revert exit in store");
        }
    }

    /// The store says someone else moved this position. Follow the store.
    async fn settle_lost_race(&self, id: Uuid) {
        match self.store.get(id).await {
            Ok(Some(stored)) if stored.is_terminal() => {
                debug!(position_id = %id, status = stored.status.as_str(), "Position already closed elsewhere");
                self.release(id).await;
            }
            Ok(_) => {
                self.cache.revert_exit(id);
            }
            Err(e) => {
                warn!(position_id = %id, error = %e, "Failed to read position after lost exit race");
                self.cache.revert_exit(id);
            }
        }
    }
}
