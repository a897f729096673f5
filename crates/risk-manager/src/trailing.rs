//! Peak tracking and tiered trailing stops.
//!
//! Once per cycle, before rules run, each position's peaks are raised and its
//! stop is stepped up the tier table. The two drawdown exits that depend on
//! those peaks live here as ordinary rules.

use options_core::config::{RiskConfig, TrailingTier};
use options_core::db::PositionStore;
use options_core::types::{Position, StopModification};
use options_core::Result;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use trading_engine::OrderRouter;

use crate::pnl_cache::PnlCache;
use crate::position_cache::PositionCache;
use crate::rule_engine::{ExitSignal, Rule, RuleContext, RuleResult};
use crate::rules::{PEAK_DRAWDOWN, TRAILING_STOP};

/// What one trailing pass changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrailingUpdate {
    pub peaks_raised: bool,
    /// New stop price when the stop moved.
    pub new_stop: Option<Decimal>,
    pub tier: Option<usize>,
}

impl TrailingUpdate {
    pub fn changed(&self) -> bool {
        self.peaks_raised || self.new_stop.is_some()
    }
}

pub struct TrailingEngine {
    tiers: Vec<TrailingTier>,
    store: Arc<dyn PositionStore>,
    router: Arc<dyn OrderRouter>,
}

impl TrailingEngine {
    pub fn new(
        tiers: Vec<TrailingTier>,
        store: Arc<dyn PositionStore>,
        router: Arc<dyn OrderRouter>,
    ) -> Self {
        Self {
            tiers,
            store,
            router,
        }
    }

    /// Highest tier whose profit milestone `peak_pct` has reached.
    pub fn tier_for(&self, peak_pct: Decimal) -> Option<usize> {
        self.tiers
            .iter()
            .rposition(|tier| peak_pct >= tier.min_profit_pct)
    }

    /// Raise peaks and step the stop on `position` in place.
    ///
    /// The tier only advances; a stop only moves in the protective direction.
    pub fn adjust(&self, position: &mut Position) -> Result<TrailingUpdate> {
        let peaks_raised = position.raise_peaks()?;
        let mut update = TrailingUpdate {
            peaks_raised,
            new_stop: None,
            tier: position.trailing_tier,
        };

        let Some(tier) = self.tier_for(position.peak_pnl_pct) else {
            return Ok(update);
        };
        if position.trailing_tier.is_some_and(|current| current >= tier) {
            return Ok(update);
        }

        let candidate = position.stop_for_offset(self.tiers[tier].stop_offset_pct);
        position.trailing_tier = Some(tier);
        update.tier = Some(tier);
        if position.is_protective_stop(candidate) {
            position.stop_price = Some(candidate);
            update.new_stop = Some(candidate);
        }
        Ok(update)
    }

    /// Run one trailing pass on a cycle's copy of a position and persist
    /// what moved.
    ///
    /// Peaks and the stop are adjusted on `position`, then merged into the
    /// cached entry without touching its price. Returns None when the
    /// position is no longer cached.
    pub async fn apply(
        &self,
        cache: &PositionCache,
        pnl_cache: &PnlCache,
        position: &mut Position,
    ) -> Result<Option<TrailingUpdate>> {
        let position_id = position.id;
        let update = self.adjust(position)?;

        let Some(merged) = cache.update_with(position_id, |cached| {
            if cached.peak_pnl_pct < position.peak_pnl_pct {
                cached.peak_pnl_pct = position.peak_pnl_pct;
            }
            if cached.high_water_mark < position.high_water_mark {
                cached.high_water_mark = position.high_water_mark;
            }
            if let Some(tier) = update.tier {
                if cached.trailing_tier.map_or(true, |current| current < tier) {
                    cached.trailing_tier = Some(tier);
                }
            }
            if let Some(stop) = update.new_stop {
                if cached.is_protective_stop(stop) {
                    cached.stop_price = Some(stop);
                }
            }
            cached.clone()
        }) else {
            return Ok(None);
        };

        if update.changed() {
            pnl_cache.store(&merged.snapshot()).await?;
        }

        if let Some(stop) = update.new_stop {
            info!(
                position_id = %position_id,
                tier = ?update.tier,
                stop_price = %stop,
                peak_pnl_pct = %position.peak_pnl_pct,
                "Trailing stop raised"
            );
            self.store.update_stop(position_id, stop, update.tier).await?;

            if let Some(broker_ref) = &position.broker_order_ref {
                let modification = StopModification {
                    broker_order_ref: broker_ref.clone(),
                    instrument_id: position.instrument.instrument_id.clone(),
                    stop_price: stop,
                };
                // The local stop stays authoritative if the broker call fails.
                if let Err(e) = self.router.modify_stop(&modification).await {
                    warn!(
                        position_id = %position_id,
                        error = %e,
                        "Failed to move broker-side stop"
                    );
                }
            }
        }

        Ok(Some(update))
    }
}

/// Exit on a pullback from the peak PnL percentage, armed only after enough
/// profit or a locked-in stop.
pub struct PeakDrawdownRule {
    drawdown_pct: Decimal,
    activation_profit_pct: Decimal,
    activation_stop_offset_pct: Option<Decimal>,
}

impl PeakDrawdownRule {
    pub fn new(
        drawdown_pct: Decimal,
        activation_profit_pct: Decimal,
        activation_stop_offset_pct: Option<Decimal>,
    ) -> Self {
        Self {
            drawdown_pct,
            activation_profit_pct,
            activation_stop_offset_pct,
        }
    }

    pub fn from_config(config: &RiskConfig) -> Self {
        Self::new(
            config.peak_drawdown_pct,
            config.peak_drawdown_activation_profit_pct,
            config.peak_drawdown_activation_stop_offset_pct,
        )
    }

    fn armed(&self, position: &Position) -> bool {
        if position.peak_pnl_pct >= self.activation_profit_pct {
            return true;
        }
        match (self.activation_stop_offset_pct, position.stop_offset_pct()) {
            (Some(required), Some(offset)) => offset >= required,
            _ => false,
        }
    }
}

impl Rule for PeakDrawdownRule {
    fn name(&self) -> &'static str {
        PEAK_DRAWDOWN
    }

    fn priority(&self) -> u32 {
        45
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<RuleResult> {
        let position = ctx.position;
        if !self.armed(position) {
            return Ok(RuleResult::NoAction);
        }

        let drawdown = position.peak_pnl_pct - position.pnl_pct;
        if drawdown >= self.drawdown_pct {
            return Ok(RuleResult::Exit(ExitSignal::new(
                PEAK_DRAWDOWN,
                format!(
                    "peak drawdown: pnl {:.2}% is {:.2} points off peak {:.2}%",
                    position.pnl_pct, drawdown, position.peak_pnl_pct
                ),
                json!({
                    "peak_pnl_pct": position.peak_pnl_pct.to_string(),
                    "pnl_pct": position.pnl_pct.to_string(),
                    "drawdown": drawdown.to_string(),
                    "limit": self.drawdown_pct.to_string(),
                }),
            )));
        }
        Ok(RuleResult::NoAction)
    }
}

/// Absolute-currency giveback from the high-water mark.
pub struct TrailingStopRule {
    amount: Option<Decimal>,
}

impl TrailingStopRule {
    pub fn new(amount: Option<Decimal>) -> Self {
        Self { amount }
    }
}

impl Rule for TrailingStopRule {
    fn name(&self) -> &'static str {
        TRAILING_STOP
    }

    fn priority(&self) -> u32 {
        50
    }

    fn enabled(&self) -> bool {
        self.amount.is_some()
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<RuleResult> {
        let Some(amount) = self.amount else {
            return Ok(RuleResult::Skip("no trailing amount configured".to_string()));
        };
        let position = ctx.position;
        // Only trails once the position has been in profit.
        if position.high_water_mark <= Decimal::ZERO {
            return Ok(RuleResult::NoAction);
        }

        let giveback = position.high_water_mark - position.pnl;
        if giveback >= amount {
            return Ok(RuleResult::Exit(ExitSignal::new(
                TRAILING_STOP,
                format!(
                    "trailing stop: gave back {} from high-water mark {}",
                    giveback, position.high_water_mark
                ),
                json!({
                    "high_water_mark": position.high_water_mark.to_string(),
                    "pnl": position.pnl.to_string(),
                    "amount": amount.to_string(),
                }),
            )));
        }
        Ok(RuleResult::NoAction)
    }
}
