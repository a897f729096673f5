//! Latest trend/volatility state of option underlyings.

use dashmap::DashMap;
use options_core::types::UnderlyingState;

/// Read side consumed by the monitoring cycle.
pub trait UnderlyingSource: Send + Sync {
    fn underlying_state(&self, underlying_id: &str) -> Option<UnderlyingState>;
}

/// Board the analysis side publishes into and the risk loop reads from.
#[derive(Default)]
pub struct UnderlyingBoard {
    states: DashMap<String, UnderlyingState>,
}

impl UnderlyingBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the state for its underlying. Older updates are ignored.
    pub fn publish(&self, state: UnderlyingState) {
        self.states
            .entry(state.underlying_id.clone())
            .and_modify(|current| {
                if state.updated_at >= current.updated_at {
                    *current = state.clone();
                }
            })
            .or_insert(state);
    }

    pub fn clear(&self, underlying_id: &str) {
        self.states.remove(underlying_id);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl UnderlyingSource for UnderlyingBoard {
    fn underlying_state(&self, underlying_id: &str) -> Option<UnderlyingState> {
        self.states.get(underlying_id).map(|s| s.clone())
    }
}
