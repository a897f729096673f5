//! Order routing contract used by the exit path.

use async_trait::async_trait;
use options_core::types::{ExitOrder, OrderConfirmation, StopModification};
use options_core::Result;

#[async_trait]
pub trait OrderRouter: Send + Sync {
    /// Submit a market order closing a position. A rejection by the broker
    /// comes back as a non-successful confirmation; transport failures as
    /// errors.
    async fn submit_exit(&self, order: &ExitOrder) -> Result<OrderConfirmation>;

    /// Move a broker-side stop order.
    async fn modify_stop(&self, modification: &StopModification) -> Result<()>;

    /// Real orders, as opposed to paper fills.
    fn is_live(&self) -> bool;

    /// Circuit-breaker key for this route.
    fn breaker_key(&self) -> &'static str {
        if self.is_live() {
            "orders:live"
        } else {
            "orders:paper"
        }
    }
}
