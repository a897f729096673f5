//! Cached profit-and-loss snapshots.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Last-known PnL state of a position, as held by the shared cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlSnapshot {
    pub position_id: Uuid,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
    pub last_price: Decimal,
    pub high_water_mark: Decimal,
    pub peak_pnl_pct: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl PnlSnapshot {
    /// Age of the snapshot at `now`. Snapshots stamped in the future count as
    /// zero age.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Whether the snapshot can be trusted at `now`.
    ///
    /// The boundary is inclusive: a snapshot exactly `threshold` old is fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now) <= threshold
    }
}
