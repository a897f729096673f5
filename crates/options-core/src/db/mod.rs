//! Durable position storage.
//!
//! The risk engine only talks to [`PositionStore`]. PostgreSQL backs it in
//! production; [`MemoryPositionStore`] backs tests and paper runs without a
//! database.

pub mod memory;
pub mod positions;

pub use memory::MemoryPositionStore;
pub use positions::PgPositionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::path::Path;
use uuid::Uuid;

use crate::types::{PnlSnapshot, Position, PositionStatus};
use crate::{Error, Result};

/// Fields written together with a status transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub exit_price: Option<Decimal>,
    pub exit_reason: Option<String>,
    pub exited_at: Option<DateTime<Utc>>,
}

impl StatusPatch {
    pub fn exit(price: Decimal, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            exit_price: Some(price),
            exit_reason: Some(reason.into()),
            exited_at: Some(at),
        }
    }
}

/// Reject transitions the position lifecycle does not allow, before any
/// conditional write is attempted.
pub(crate) fn ensure_transition(id: Uuid, from: PositionStatus, to: PositionStatus) -> Result<()> {
    if from.is_terminal() || !from.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            position_id: id,
            from,
            to,
        });
    }
    Ok(())
}

/// Durable store contract.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn create(&self, position: &Position) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Position>>;

    /// Positions the risk loop is responsible for (active or exiting).
    async fn list_active(&self) -> Result<Vec<Position>>;

    /// Atomically move `id` from `from` to `to`. Returns false, with nothing
    /// written, when the stored status is not `from`. Transitions outside the
    /// lifecycle fail with `InvalidTransition`.
    async fn transition_status(
        &self,
        id: Uuid,
        from: PositionStatus,
        to: PositionStatus,
        patch: StatusPatch,
    ) -> Result<bool>;

    /// Throttled write-back of cached PnL.
    async fn update_pnl(&self, snapshot: &PnlSnapshot) -> Result<()>;

    /// Persist a trailed stop and the tier that produced it.
    async fn update_stop(
        &self,
        id: Uuid,
        stop_price: Decimal,
        trailing_tier: Option<usize>,
    ) -> Result<()>;
}

/// Create a PostgreSQL connection pool.
pub async fn create_pool(url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;

    Ok(pool)
}

/// Run database migrations from the migrations directory.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(Path::new("./migrations")).await?;
    migrator.run(pool).await?;
    Ok(())
}
