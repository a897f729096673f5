//! Position tracking types for option trades.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::OrderSide;
use super::pnl::PnlSnapshot;
use crate::error::{Error, Result};

/// Current state of a position in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Created by the entry subsystem, entry not yet confirmed.
    Pending,
    /// Entry filled, monitored every cycle.
    Active,
    /// Exit claimed by one caller and in flight.
    Exiting,
    /// Closed. Terminal.
    Exited,
    /// Abandoned before or after entry without an exit trade. Terminal.
    Cancelled,
}

impl PositionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PositionStatus::Exited | PositionStatus::Cancelled)
    }

    /// Whether the risk loop is responsible for this position.
    pub fn is_live(self) -> bool {
        matches!(self, PositionStatus::Active | PositionStatus::Exiting)
    }

    pub fn can_transition_to(self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Cancelled)
                | (Active, Exiting)
                | (Active, Exited)
                | (Active, Cancelled)
                | (Exiting, Exited)
                | (Exiting, Active)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PositionStatus::Pending => "pending",
            PositionStatus::Active => "active",
            PositionStatus::Exiting => "exiting",
            PositionStatus::Exited => "exited",
            PositionStatus::Cancelled => "cancelled",
        }
    }

    /// Database representation.
    pub fn as_i16(self) -> i16 {
        match self {
            PositionStatus::Pending => 0,
            PositionStatus::Active => 1,
            PositionStatus::Exiting => 2,
            PositionStatus::Exited => 3,
            PositionStatus::Cancelled => 4,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(PositionStatus::Pending),
            1 => Some(PositionStatus::Active),
            2 => Some(PositionStatus::Exiting),
            3 => Some(PositionStatus::Exited),
            4 => Some(PositionStatus::Cancelled),
            _ => None,
        }
    }
}

/// Direction of the trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that flattens a position on this side.
    pub fn exit_order_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }

    fn sign(self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionKind {
    #[serde(rename = "CE")]
    Call,
    #[serde(rename = "PE")]
    Put,
}

/// Directional view implied by holding a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketBias {
    Bullish,
    Bearish,
}

/// Reference to a tradeable instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    /// Exchange segment (e.g. `NFO`).
    pub segment: String,
    /// Exchange-assigned instrument identifier, the key ticks arrive under.
    pub instrument_id: String,
    /// Human-readable trading symbol.
    pub symbol: String,
    /// Set when the instrument is an option.
    pub option_kind: Option<OptionKind>,
    /// Instrument id of the underlying, for options.
    pub underlying_id: Option<String>,
}

impl Instrument {
    pub fn new(
        segment: impl Into<String>,
        instrument_id: impl Into<String>,
        symbol: impl Into<String>,
    ) -> Self {
        Self {
            segment: segment.into(),
            instrument_id: instrument_id.into(),
            symbol: symbol.into(),
            option_kind: None,
            underlying_id: None,
        }
    }

    pub fn option(mut self, kind: OptionKind, underlying_id: impl Into<String>) -> Self {
        self.option_kind = Some(kind);
        self.underlying_id = Some(underlying_id.into());
        self
    }
}

/// Leg of a bracket order attached at entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BracketLeg {
    StopLoss,
    Target,
}

/// Broker report that an attached bracket leg filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketFill {
    pub leg: BracketLeg,
    pub price: Decimal,
    pub filled_at: DateTime<Utc>,
}

/// A single option position monitored by the risk engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub instrument: Instrument,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub status: PositionStatus,
    /// Protective stop. Moved by the trailing engine.
    pub stop_price: Option<Decimal>,
    pub target_price: Option<Decimal>,
    pub current_price: Decimal,
    /// Unrealized profit in currency.
    pub pnl: Decimal,
    /// Unrealized profit in percent of entry.
    pub pnl_pct: Decimal,
    /// Best pnl_pct seen while live.
    pub peak_pnl_pct: Decimal,
    /// Best absolute pnl seen while live.
    pub high_water_mark: Decimal,
    /// Index of the highest trailing tier applied so far.
    pub trailing_tier: Option<usize>,
    pub bracket_fill: Option<BracketFill>,
    /// Timestamp of the price behind `current_price`.
    pub last_price_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub exit_reason: Option<String>,
    /// Paper position, exits are simulated.
    pub simulated: bool,
    /// Broker reference of the entry order, required to move broker-side stops.
    pub broker_order_ref: Option<String>,
}

impl Position {
    /// Create a new pending position.
    pub fn new(
        instrument: Instrument,
        side: PositionSide,
        quantity: Decimal,
        entry_price: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            instrument,
            side,
            quantity,
            entry_price,
            status: PositionStatus::Pending,
            stop_price: None,
            target_price: None,
            current_price: entry_price,
            pnl: Decimal::ZERO,
            pnl_pct: Decimal::ZERO,
            peak_pnl_pct: Decimal::ZERO,
            high_water_mark: Decimal::ZERO,
            trailing_tier: None,
            bracket_fill: None,
            last_price_at: now,
            created_at: now,
            exited_at: None,
            exit_price: None,
            exit_reason: None,
            simulated: false,
            broker_order_ref: None,
        }
    }

    pub fn with_stop(mut self, stop_price: Decimal) -> Self {
        self.stop_price = Some(stop_price);
        self
    }

    pub fn with_target(mut self, target_price: Decimal) -> Self {
        self.target_price = Some(target_price);
        self
    }

    pub fn with_broker_ref(mut self, broker_order_ref: impl Into<String>) -> Self {
        self.broker_order_ref = Some(broker_order_ref.into());
        self
    }

    pub fn simulated(mut self) -> Self {
        self.simulated = true;
        self
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn instrument_id(&self) -> &str {
        &self.instrument.instrument_id
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::Validation(format!(
                "position {} is {} and immutable",
                self.id,
                self.status.as_str()
            )));
        }
        Ok(())
    }

    /// Move to `next`, enforcing the lifecycle state machine.
    pub fn transition(&mut self, next: PositionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                position_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Entry confirmed. Only valid from Pending.
    pub fn activate(&mut self) -> Result<()> {
        self.transition(PositionStatus::Active)
    }

    /// Claim the exit. Only valid from Active.
    pub fn begin_exit(&mut self) -> Result<()> {
        self.transition(PositionStatus::Exiting)
    }

    /// Give up an in-flight exit so it is retried next cycle.
    pub fn revert_exit(&mut self) -> Result<()> {
        if self.status != PositionStatus::Exiting {
            return Err(Error::InvalidTransition {
                position_id: self.id,
                from: self.status,
                to: PositionStatus::Active,
            });
        }
        self.status = PositionStatus::Active;
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.transition(PositionStatus::Cancelled)
    }

    /// Record the closing trade and move to Exited.
    pub fn mark_exited(
        &mut self,
        exit_price: Decimal,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_mutable()?;
        self.transition(PositionStatus::Exited)?;
        self.current_price = exit_price;
        self.derive_pnl();
        self.exit_price = Some(exit_price);
        self.exit_reason = Some(reason.into());
        self.exited_at = Some(at);
        Ok(())
    }

    /// Apply a new market price and recompute PnL from it.
    ///
    /// Peaks are left alone; the trailing engine owns them.
    pub fn apply_price(&mut self, price: Decimal, at: DateTime<Utc>) -> Result<()> {
        self.ensure_mutable()?;
        if price <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "non-positive price {} for {}",
                price, self.instrument.instrument_id
            )));
        }
        self.current_price = price;
        self.last_price_at = at;
        self.derive_pnl();
        Ok(())
    }

    fn derive_pnl(&mut self) {
        let move_per_unit = (self.current_price - self.entry_price) * self.side.sign();
        self.pnl = move_per_unit * self.quantity;
        self.pnl_pct = if self.entry_price > Decimal::ZERO {
            (move_per_unit / self.entry_price * Decimal::ONE_HUNDRED).round_dp(4)
        } else {
            Decimal::ZERO
        };
    }

    /// Raise the peaks to the current PnL. Returns true when either moved.
    pub fn raise_peaks(&mut self) -> Result<bool> {
        self.ensure_mutable()?;
        let mut changed = false;
        if self.pnl_pct > self.peak_pnl_pct {
            self.peak_pnl_pct = self.pnl_pct;
            changed = true;
        }
        if self.pnl > self.high_water_mark {
            self.high_water_mark = self.pnl;
            changed = true;
        }
        Ok(changed)
    }

    /// Merge a cached snapshot. Older snapshots than the position's own price
    /// only contribute their peaks.
    pub fn apply_snapshot(&mut self, snapshot: &PnlSnapshot) -> Result<()> {
        self.ensure_mutable()?;
        if snapshot.timestamp > self.last_price_at {
            self.apply_price(snapshot.last_price, snapshot.timestamp)?;
        }
        self.peak_pnl_pct = self.peak_pnl_pct.max(snapshot.peak_pnl_pct);
        self.high_water_mark = self.high_water_mark.max(snapshot.high_water_mark);
        Ok(())
    }

    pub fn snapshot(&self) -> PnlSnapshot {
        PnlSnapshot {
            position_id: self.id,
            pnl: self.pnl,
            pnl_pct: self.pnl_pct,
            last_price: self.current_price,
            high_water_mark: self.high_water_mark,
            peak_pnl_pct: self.peak_pnl_pct,
            timestamp: self.last_price_at,
        }
    }

    /// Directional bias of the position: long calls and short puts are
    /// bullish, the reverse bearish. None for non-option instruments held
    /// without an underlying.
    pub fn bias(&self) -> Option<MarketBias> {
        let kind = self.instrument.option_kind?;
        let bias = match (kind, self.side) {
            (OptionKind::Call, PositionSide::Long) | (OptionKind::Put, PositionSide::Short) => {
                MarketBias::Bullish
            }
            (OptionKind::Call, PositionSide::Short) | (OptionKind::Put, PositionSide::Long) => {
                MarketBias::Bearish
            }
        };
        Some(bias)
    }

    /// Stop distance from entry in percent, signed so that a positive value
    /// means profit is locked in.
    pub fn stop_offset_pct(&self) -> Option<Decimal> {
        let stop = self.stop_price?;
        if self.entry_price <= Decimal::ZERO {
            return None;
        }
        let offset = (stop - self.entry_price) * self.side.sign() / self.entry_price
            * Decimal::ONE_HUNDRED;
        Some(offset.round_dp(4))
    }

    /// Stop price for a given offset in percent of entry.
    pub fn stop_for_offset(&self, offset_pct: Decimal) -> Decimal {
        let factor = offset_pct / Decimal::ONE_HUNDRED * self.side.sign();
        self.entry_price * (Decimal::ONE + factor)
    }

    /// Whether `candidate` is a tighter stop than the current one.
    pub fn is_protective_stop(&self, candidate: Decimal) -> bool {
        match (self.stop_price, self.side) {
            (None, _) => true,
            (Some(current), PositionSide::Long) => candidate > current,
            (Some(current), PositionSide::Short) => candidate < current,
        }
    }

    /// Whether the current price has reached the stop.
    pub fn stop_crossed(&self) -> bool {
        match (self.stop_price, self.side) {
            (Some(stop), PositionSide::Long) => self.current_price <= stop,
            (Some(stop), PositionSide::Short) => self.current_price >= stop,
            (None, _) => false,
        }
    }

    /// Whether the current price has reached the target.
    pub fn target_crossed(&self) -> bool {
        match (self.target_price, self.side) {
            (Some(target), PositionSide::Long) => self.current_price >= target,
            (Some(target), PositionSide::Short) => self.current_price <= target,
            (None, _) => false,
        }
    }
}
