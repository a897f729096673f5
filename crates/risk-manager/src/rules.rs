//! Standard exit rules.
//!
//! Priority order: session_end (10), stop_loss (20), bracket_limit (25),
//! take_profit (30), secure_profit (35), time_exit (40), peak_drawdown (45),
//! trailing_stop (50), underlying_exit (60).

use chrono::NaiveTime;
use options_core::config::RiskConfig;
use options_core::types::{BracketLeg, MarketBias, TrendDirection};
use options_core::{Error, Result};
use rust_decimal::Decimal;
use serde_json::json;

use crate::rule_engine::{ExitSignal, Rule, RuleContext, RuleResult};
use crate::trailing::{PeakDrawdownRule, TrailingStopRule};

pub const SESSION_END: &str = "session_end";
pub const STOP_LOSS: &str = "stop_loss";
pub const BRACKET_LIMIT: &str = "bracket_limit";
pub const TAKE_PROFIT: &str = "take_profit";
pub const SECURE_PROFIT: &str = "secure_profit";
pub const TIME_EXIT: &str = "time_exit";
pub const PEAK_DRAWDOWN: &str = "peak_drawdown";
pub const TRAILING_STOP: &str = "trailing_stop";
pub const UNDERLYING_EXIT: &str = "underlying_exit";

/// Build every standard rule from `config`. Disabled rules are filtered by
/// the engine.
pub fn standard_rules(config: &RiskConfig) -> Result<Vec<Box<dyn Rule>>> {
    Ok(vec![
        Box::new(SessionEndRule::new(
            config.session_close_time()?,
            config.session_exit_buffer_mins,
        )),
        Box::new(StopLossRule::new(config.sl_pct)),
        Box::new(BracketLimitRule),
        Box::new(TakeProfitRule::new(config.tp_pct)),
        Box::new(SecureProfitRule::new(
            config.secure_profit_threshold,
            config.secure_profit_drawdown_pct,
        )),
        Box::new(TimeExitRule::new(
            config.time_exit_time()?,
            config.min_profit_for_time_exit,
        )),
        Box::new(PeakDrawdownRule::from_config(config)),
        Box::new(TrailingStopRule::new(config.trailing_stop_amount)),
        Box::new(UnderlyingExitRule::new(
            config.underlying_min_adx,
            config.underlying_min_atr_pct,
        )),
    ])
}

fn require_entry(ctx: &RuleContext<'_>) -> Result<()> {
    if ctx.position.entry_price <= Decimal::ZERO {
        return Err(Error::Validation(format!(
            "position {} has no entry price",
            ctx.position.id
        )));
    }
    Ok(())
}

/// Closes everything shortly before the session ends, regardless of PnL.
pub struct SessionEndRule {
    close: Option<NaiveTime>,
    buffer_mins: u32,
}

impl SessionEndRule {
    pub fn new(close: Option<NaiveTime>, buffer_mins: u32) -> Self {
        Self { close, buffer_mins }
    }

    fn cutoff(&self) -> Option<NaiveTime> {
        self.close
            .map(|close| close - chrono::Duration::minutes(i64::from(self.buffer_mins)))
    }
}

impl Rule for SessionEndRule {
    fn name(&self) -> &'static str {
        SESSION_END
    }

    fn priority(&self) -> u32 {
        10
    }

    fn enabled(&self) -> bool {
        self.close.is_some()
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<RuleResult> {
        let Some(cutoff) = self.cutoff() else {
            return Ok(RuleResult::Skip("no session close configured".to_string()));
        };
        let local = ctx.market_now.time();
        if local >= cutoff {
            return Ok(RuleResult::Exit(ExitSignal::new(
                SESSION_END,
                format!(
                    "session end: {} at or past cutoff {}",
                    local.format("%H:%M:%S"),
                    cutoff.format("%H:%M")
                ),
                json!({
                    "market_time": local.format("%H:%M:%S").to_string(),
                    "cutoff": cutoff.format("%H:%M").to_string(),
                    "pnl_pct": ctx.position.pnl_pct.to_string(),
                }),
            )));
        }
        Ok(RuleResult::NoAction)
    }
}

/// Percentage stop-loss, plus the (possibly trailed) stop price.
pub struct StopLossRule {
    sl_pct: Decimal,
}

impl StopLossRule {
    pub fn new(sl_pct: Decimal) -> Self {
        Self { sl_pct }
    }
}

impl Rule for StopLossRule {
    fn name(&self) -> &'static str {
        STOP_LOSS
    }

    fn priority(&self) -> u32 {
        20
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<RuleResult> {
        require_entry(ctx)?;
        let position = ctx.position;

        if position.pnl_pct <= -self.sl_pct {
            return Ok(RuleResult::Exit(ExitSignal::new(
                STOP_LOSS,
                format!(
                    "stop loss: pnl {:.2}% breached -{:.2}%",
                    position.pnl_pct, self.sl_pct
                ),
                json!({
                    "pnl_pct": position.pnl_pct.to_string(),
                    "sl_pct": self.sl_pct.to_string(),
                    "price": position.current_price.to_string(),
                }),
            )));
        }

        if position.stop_crossed() {
            let stop = position.stop_price.unwrap_or_default();
            return Ok(RuleResult::Exit(ExitSignal::new(
                STOP_LOSS,
                format!(
                    "stop price {} crossed at {} (pnl {:.2}%)",
                    stop, position.current_price, position.pnl_pct
                ),
                json!({
                    "stop_price": stop.to_string(),
                    "price": position.current_price.to_string(),
                    "pnl_pct": position.pnl_pct.to_string(),
                    "trailing_tier": position.trailing_tier,
                }),
            )));
        }

        Ok(RuleResult::NoAction)
    }
}

/// The broker already filled an attached stop or target leg.
pub struct BracketLimitRule;

impl Rule for BracketLimitRule {
    fn name(&self) -> &'static str {
        BRACKET_LIMIT
    }

    fn priority(&self) -> u32 {
        25
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<RuleResult> {
        let Some(fill) = &ctx.position.bracket_fill else {
            return Ok(RuleResult::NoAction);
        };
        let leg = match fill.leg {
            BracketLeg::StopLoss => "stop_loss",
            BracketLeg::Target => "target",
        };
        Ok(RuleResult::Exit(ExitSignal::new(
            BRACKET_LIMIT,
            format!("bracket {} leg filled at {}", leg, fill.price),
            json!({
                "leg": leg,
                "fill_price": fill.price.to_string(),
                "filled_at": fill.filled_at.to_rfc3339(),
            }),
        )))
    }
}

/// Percentage take-profit, plus the target price.
pub struct TakeProfitRule {
    tp_pct: Decimal,
}

impl TakeProfitRule {
    pub fn new(tp_pct: Decimal) -> Self {
        Self { tp_pct }
    }
}

impl Rule for TakeProfitRule {
    fn name(&self) -> &'static str {
        TAKE_PROFIT
    }

    fn priority(&self) -> u32 {
        30
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<RuleResult> {
        require_entry(ctx)?;
        let position = ctx.position;

        if position.pnl_pct >= self.tp_pct {
            return Ok(RuleResult::Exit(ExitSignal::new(
                TAKE_PROFIT,
                format!(
                    "take profit: pnl {:.2}% reached {:.2}%",
                    position.pnl_pct, self.tp_pct
                ),
                json!({
                    "pnl_pct": position.pnl_pct.to_string(),
                    "tp_pct": self.tp_pct.to_string(),
                }),
            )));
        }

        if position.target_crossed() {
            let target = position.target_price.unwrap_or_default();
            return Ok(RuleResult::Exit(ExitSignal::new(
                TAKE_PROFIT,
                format!(
                    "target {} reached at {} (pnl {:.2}%)",
                    target, position.current_price, position.pnl_pct
                ),
                json!({
                    "target_price": target.to_string(),
                    "price": position.current_price.to_string(),
                }),
            )));
        }

        Ok(RuleResult::NoAction)
    }
}

/// Once absolute profit has reached a threshold, exit on a drawdown from the
/// absolute peak measured in percent of that peak.
pub struct SecureProfitRule {
    threshold: Option<Decimal>,
    drawdown_pct: Decimal,
}

impl SecureProfitRule {
    pub fn new(threshold: Option<Decimal>, drawdown_pct: Decimal) -> Self {
        Self {
            threshold,
            drawdown_pct,
        }
    }
}

impl Rule for SecureProfitRule {
    fn name(&self) -> &'static str {
        SECURE_PROFIT
    }

    fn priority(&self) -> u32 {
        35
    }

    fn enabled(&self) -> bool {
        self.threshold.is_some()
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<RuleResult> {
        let Some(threshold) = self.threshold else {
            return Ok(RuleResult::Skip("no threshold configured".to_string()));
        };
        let position = ctx.position;
        let peak = position.high_water_mark;
        if peak < threshold || peak <= Decimal::ZERO {
            return Ok(RuleResult::NoAction);
        }

        let drawdown_pct = ((peak - position.pnl) / peak * Decimal::ONE_HUNDRED).round_dp(4);
        if drawdown_pct >= self.drawdown_pct {
            return Ok(RuleResult::Exit(ExitSignal::new(
                SECURE_PROFIT,
                format!(
                    "secure profit: gave back {:.2}% of peak {} (limit {:.2}%)",
                    drawdown_pct, peak, self.drawdown_pct
                ),
                json!({
                    "high_water_mark": peak.to_string(),
                    "pnl": position.pnl.to_string(),
                    "drawdown_pct": drawdown_pct.to_string(),
                }),
            )));
        }
        Ok(RuleResult::NoAction)
    }
}

/// After a wall-clock time, close positions that are at least minimally
/// profitable.
pub struct TimeExitRule {
    at: Option<NaiveTime>,
    min_profit_pct: Decimal,
}

impl TimeExitRule {
    pub fn new(at: Option<NaiveTime>, min_profit_pct: Decimal) -> Self {
        Self { at, min_profit_pct }
    }
}

impl Rule for TimeExitRule {
    fn name(&self) -> &'static str {
        TIME_EXIT
    }

    fn priority(&self) -> u32 {
        40
    }

    fn enabled(&self) -> bool {
        self.at.is_some()
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<RuleResult> {
        let Some(at) = self.at else {
            return Ok(RuleResult::Skip("no exit time configured".to_string()));
        };
        let local = ctx.market_now.time();
        let pnl_pct = ctx.position.pnl_pct;
        if local >= at && pnl_pct >= self.min_profit_pct {
            return Ok(RuleResult::Exit(ExitSignal::new(
                TIME_EXIT,
                format!(
                    "time exit at {} with pnl {:.2}%",
                    local.format("%H:%M"),
                    pnl_pct
                ),
                json!({
                    "exit_at": at.format("%H:%M").to_string(),
                    "pnl_pct": pnl_pct.to_string(),
                }),
            )));
        }
        Ok(RuleResult::NoAction)
    }
}

/// Exit when the underlying no longer supports the position's direction.
pub struct UnderlyingExitRule {
    min_adx: Option<Decimal>,
    min_atr_pct: Option<Decimal>,
}

impl UnderlyingExitRule {
    pub fn new(min_adx: Option<Decimal>, min_atr_pct: Option<Decimal>) -> Self {
        Self {
            min_adx,
            min_atr_pct,
        }
    }
}

impl Rule for UnderlyingExitRule {
    fn name(&self) -> &'static str {
        UNDERLYING_EXIT
    }

    fn priority(&self) -> u32 {
        60
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<RuleResult> {
        let Some(state) = ctx.underlying else {
            return Ok(RuleResult::Skip("no underlying state".to_string()));
        };
        let Some(bias) = ctx.position.bias() else {
            return Ok(RuleResult::Skip("position has no directional bias".to_string()));
        };

        let against = match (bias, state.structure_break) {
            (MarketBias::Bullish, Some(TrendDirection::Down)) => true,
            (MarketBias::Bearish, Some(TrendDirection::Up)) => true,
            _ => false,
        };
        if against {
            return Ok(RuleResult::Exit(ExitSignal::new(
                UNDERLYING_EXIT,
                format!(
                    "underlying {} broke structure against {:?} bias",
                    state.underlying_id, bias
                ),
                json!({
                    "underlying_id": state.underlying_id,
                    "structure_break": state.structure_break,
                    "trend": state.trend,
                }),
            )));
        }

        if let (Some(min), Some(adx)) = (self.min_adx, state.adx) {
            if adx < min {
                return Ok(RuleResult::Exit(ExitSignal::new(
                    UNDERLYING_EXIT,
                    format!("underlying trend weak: ADX {:.2} < {:.2}", adx, min),
                    json!({ "adx": adx.to_string(), "min_adx": min.to_string() }),
                )));
            }
        }

        if let (Some(min), Some(atr_pct)) = (self.min_atr_pct, state.atr_pct) {
            if atr_pct < min {
                return Ok(RuleResult::Exit(ExitSignal::new(
                    UNDERLYING_EXIT,
                    format!("underlying volatility low: ATR {:.2}% < {:.2}%", atr_pct, min),
                    json!({ "atr_pct": atr_pct.to_string(), "min_atr_pct": min.to_string() }),
                )));
            }
        }

        Ok(RuleResult::NoAction)
    }
}
