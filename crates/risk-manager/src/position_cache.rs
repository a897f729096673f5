//! In-memory table of open positions.
//!
//! The hot cache is written by the tick listener on every price update and
//! read once per monitoring cycle. Per-entry dashmap locks keep price updates
//! and status changes on different positions independent.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use options_core::types::{BracketFill, Position, PositionStatus};
use options_core::{Error, Result};
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Default)]
pub struct PositionCache {
    positions: DashMap<Uuid, Position>,
    by_instrument: DashMap<String, HashSet<Uuid>>,
}

impl PositionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a position. Terminal positions are refused.
    pub fn add(&self, position: Position) -> Result<()> {
        if position.is_terminal() {
            return Err(Error::Validation(format!(
                "refusing to cache {} position {}",
                position.status.as_str(),
                position.id
            )));
        }
        self.by_instrument
            .entry(position.instrument.instrument_id.clone())
            .or_default()
            .insert(position.id);
        self.positions.insert(position.id, position);
        Ok(())
    }

    /// Apply a price to every live position on `instrument_id`. Returns the
    /// ids whose PnL changed.
    pub fn update_price(&self, instrument_id: &str, price: Decimal, at: DateTime<Utc>) -> Vec<Uuid> {
        let ids: Vec<Uuid> = match self.by_instrument.get(instrument_id) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Vec::new(),
        };

        let mut changed = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(mut position) = self.positions.get_mut(&id) else {
                continue;
            };
            if !position.is_live() {
                continue;
            }
            match position.apply_price(price, at) {
                Ok(()) => changed.push(id),
                Err(e) => warn!(position_id = %id, error = %e, "Rejected price update"),
            }
        }
        changed
    }

    pub fn get(&self, id: Uuid) -> Option<Position> {
        self.positions.get(&id).map(|p| p.clone())
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.positions.contains_key(&id)
    }

    pub fn remove(&self, id: Uuid) -> Option<Position> {
        let (_, position) = self.positions.remove(&id)?;
        let instrument_id = &position.instrument.instrument_id;
        if let Some(mut ids) = self.by_instrument.get_mut(instrument_id) {
            ids.remove(&id);
        }
        self.by_instrument
            .remove_if(instrument_id, |_, ids| ids.is_empty());
        debug!(position_id = %id, "Removed position from hot cache");
        Some(position)
    }

    /// Copy of all live positions, oldest first.
    pub fn snapshot_all(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| p.is_live())
            .map(|p| p.clone())
            .collect();
        positions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        positions
    }

    /// Mutate one entry under its lock.
    pub fn update_with<R>(&self, id: Uuid, f: impl FnOnce(&mut Position) -> R) -> Option<R> {
        self.positions.get_mut(&id).map(|mut p| f(&mut p))
    }

    /// Compare-and-set Active -> Exiting. Only one caller wins.
    pub fn try_begin_exit(&self, id: Uuid) -> bool {
        self.update_with(id, |p| {
            p.status == PositionStatus::Active && p.begin_exit().is_ok()
        })
        .unwrap_or(false)
    }

    /// Exiting -> Active after a failed exit.
    pub fn revert_exit(&self, id: Uuid) -> bool {
        self.update_with(id, |p| p.revert_exit().is_ok())
            .unwrap_or(false)
    }

    pub fn mark_bracket_filled(&self, id: Uuid, fill: BracketFill) -> bool {
        self.update_with(id, |p| {
            if p.is_terminal() {
                return false;
            }
            p.bracket_fill = Some(fill);
            true
        })
        .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.positions.iter().filter(|p| p.is_live()).count()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Instruments at least one cached position trades.
    pub fn instruments(&self) -> Vec<String> {
        let mut instruments: Vec<String> =
            self.by_instrument.iter().map(|e| e.key().clone()).collect();
        instruments.sort();
        instruments
    }

    pub fn has_instrument(&self, instrument_id: &str) -> bool {
        self.by_instrument
            .get(instrument_id)
            .map(|ids| !ids.is_empty())
            .unwrap_or(false)
    }
}
