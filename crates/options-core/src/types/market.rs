//! Market data types: streaming ticks and underlying trend state.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single last-traded-price update from the streaming feed.
///
/// Ticks are never persisted; they only drive cached PnL recomputation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Exchange segment (e.g. `NFO`, `NSE`).
    pub segment: String,
    pub instrument_id: String,
    pub price: Decimal,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    pub fn new(segment: impl Into<String>, instrument_id: impl Into<String>, price: Decimal) -> Self {
        Self {
            segment: segment.into(),
            instrument_id: instrument_id.into(),
            price,
            timestamp: Utc::now(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Trend direction of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
    Sideways,
}

/// Latest trend structure of the underlying an option is written on.
///
/// Published by the (external) indicator subsystem and read by the
/// underlying-exit rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnderlyingState {
    pub underlying_id: String,
    pub trend: TrendDirection,
    /// Direction of the most recent break of structure, if one occurred.
    pub structure_break: Option<TrendDirection>,
    /// Trend strength (ADX).
    pub adx: Option<Decimal>,
    /// Average true range as a percentage of price.
    pub atr_pct: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl UnderlyingState {
    pub fn new(underlying_id: impl Into<String>, trend: TrendDirection) -> Self {
        Self {
            underlying_id: underlying_id.into(),
            trend,
            structure_break: None,
            adx: None,
            atr_pct: None,
            updated_at: Utc::now(),
        }
    }
}
