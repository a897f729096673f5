//! In-process position store.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{PositionStore, StatusPatch};
use crate::types::{PnlSnapshot, Position, PositionStatus};
use crate::Result;

/// `PositionStore` kept in a dashmap. Transitions are conditional under the
/// entry lock, matching the SQL store's `WHERE status = $from`.
#[derive(Default)]
pub struct MemoryPositionStore {
    positions: DashMap<Uuid, Position>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn create(&self, position: &Position) -> Result<()> {
        self.positions
            .entry(position.id)
            .or_insert_with(|| position.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Position>> {
        Ok(self.positions.get(&id).map(|p| p.clone()))
    }

    async fn list_active(&self) -> Result<Vec<Position>> {
        let mut active: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| p.status.is_live())
            .map(|p| p.clone())
            .collect();
        active.sort_by_key(|p| p.created_at);
        Ok(active)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: PositionStatus,
        to: PositionStatus,
        patch: StatusPatch,
    ) -> Result<bool> {
        super::ensure_transition(id, from, to)?;
        let Some(mut entry) = self.positions.get_mut(&id) else {
            return Ok(false);
        };
        if entry.status != from {
            return Ok(false);
        }
        entry.status = to;
        if let Some(price) = patch.exit_price {
            entry.exit_price = Some(price);
        }
        if let Some(reason) = patch.exit_reason {
            entry.exit_reason = Some(reason);
        }
        if let Some(at) = patch.exited_at {
            entry.exited_at = Some(at);
        }
        Ok(true)
    }

    async fn update_pnl(&self, snapshot: &PnlSnapshot) -> Result<()> {
        if let Some(mut entry) = self.positions.get_mut(&snapshot.position_id) {
            if entry.status.is_live() {
                entry.current_price = snapshot.last_price;
                entry.pnl = snapshot.pnl;
                entry.pnl_pct = snapshot.pnl_pct;
                entry.peak_pnl_pct = entry.peak_pnl_pct.max(snapshot.peak_pnl_pct);
                entry.high_water_mark = entry.high_water_mark.max(snapshot.high_water_mark);
                entry.last_price_at = snapshot.timestamp;
            }
        }
        Ok(())
    }

    async fn update_stop(
        &self,
        id: Uuid,
        stop_price: Decimal,
        trailing_tier: Option<usize>,
    ) -> Result<()> {
        if let Some(mut entry) = self.positions.get_mut(&id) {
            if entry.status.is_live() {
                entry.stop_price = Some(stop_price);
                entry.trailing_tier = trailing_tier;
            }
        }
        Ok(())
    }
}
