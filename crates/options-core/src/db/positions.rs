//! PostgreSQL position store.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{PositionStore, StatusPatch};
use crate::types::{
    Instrument, OptionKind, PnlSnapshot, Position, PositionSide, PositionStatus,
};
use crate::{Error, Result};

const SELECT_COLUMNS: &str = r#"
    id, segment, instrument_id, symbol, option_kind, underlying_id, side,
    quantity, entry_price, status, stop_price, target_price, current_price,
    pnl, pnl_pct, peak_pnl_pct, high_water_mark, trailing_tier,
    last_price_at, created_at, exited_at, exit_price, exit_reason,
    simulated, broker_order_ref
"#;

/// Repository for position rows.
pub struct PgPositionStore {
    pool: PgPool,
}

impl PgPositionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn option_kind_code(kind: Option<OptionKind>) -> Option<i16> {
        kind.map(|k| match k {
            OptionKind::Call => 0,
            OptionKind::Put => 1,
        })
    }

    fn side_code(side: PositionSide) -> i16 {
        match side {
            PositionSide::Long => 0,
            PositionSide::Short => 1,
        }
    }

    /// Decode the stored status code. Unknown codes are an error.
    fn decode_status(id: Uuid, code: i16) -> Result<PositionStatus> {
        PositionStatus::from_i16(code).ok_or_else(|| {
            Error::Validation(format!("unknown status code {code} for position {id}"))
        })
    }

    /// Convert a database row to a Position.
    fn row_to_position(r: &sqlx::postgres::PgRow) -> Result<Position> {
        let id: Uuid = r.get("id");
        let status = Self::decode_status(id, r.get("status"))?;
        let option_kind = r
            .get::<Option<i16>, _>("option_kind")
            .map(|code| match code {
                0 => OptionKind::Call,
                _ => OptionKind::Put,
            });

        Ok(Position {
            id,
            instrument: Instrument {
                segment: r.get("segment"),
                instrument_id: r.get("instrument_id"),
                symbol: r.get("symbol"),
                option_kind,
                underlying_id: r.get("underlying_id"),
            },
            side: match r.get::<i16, _>("side") {
                0 => PositionSide::Long,
                _ => PositionSide::Short,
            },
            quantity: r.get("quantity"),
            entry_price: r.get("entry_price"),
            status,
            stop_price: r.get("stop_price"),
            target_price: r.get("target_price"),
            current_price: r.get("current_price"),
            pnl: r.get("pnl"),
            pnl_pct: r.get("pnl_pct"),
            peak_pnl_pct: r.get("peak_pnl_pct"),
            high_water_mark: r.get("high_water_mark"),
            trailing_tier: r
                .get::<Option<i32>, _>("trailing_tier")
                .map(|t| t.max(0) as usize),
            bracket_fill: None,
            last_price_at: r.get("last_price_at"),
            created_at: r.get("created_at"),
            exited_at: r.get("exited_at"),
            exit_price: r.get("exit_price"),
            exit_reason: r.get("exit_reason"),
            simulated: r.get("simulated"),
            broker_order_ref: r.get("broker_order_ref"),
        })
    }
}

#[async_trait]
impl PositionStore for PgPositionStore {
    async fn create(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, segment, instrument_id, symbol, option_kind, underlying_id, side,
                quantity, entry_price, status, stop_price, target_price, current_price,
                pnl, pnl_pct, peak_pnl_pct, high_water_mark, trailing_tier,
                last_price_at, created_at, simulated, broker_order_ref
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(position.id)
        .bind(&position.instrument.segment)
        .bind(&position.instrument.instrument_id)
        .bind(&position.instrument.symbol)
        .bind(Self::option_kind_code(position.instrument.option_kind))
        .bind(&position.instrument.underlying_id)
        .bind(Self::side_code(position.side))
        .bind(position.quantity)
        .bind(position.entry_price)
        .bind(position.status.as_i16())
        .bind(position.stop_price)
        .bind(position.target_price)
        .bind(position.current_price)
        .bind(position.pnl)
        .bind(position.pnl_pct)
        .bind(position.peak_pnl_pct)
        .bind(position.high_water_mark)
        .bind(position.trailing_tier.map(|t| t as i32))
        .bind(position.last_price_at)
        .bind(position.created_at)
        .bind(position.simulated)
        .bind(&position.broker_order_ref)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Position>> {
        let query = format!("SELECT {SELECT_COLUMNS} FROM positions WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::row_to_position(&r)).transpose()
    }

    async fn list_active(&self) -> Result<Vec<Position>> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM positions WHERE status IN ($1, $2) ORDER BY created_at"
        );
        let rows = sqlx::query(&query)
            .bind(PositionStatus::Active.as_i16())
            .bind(PositionStatus::Exiting.as_i16())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_position).collect()
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: PositionStatus,
        to: PositionStatus,
        patch: StatusPatch,
    ) -> Result<bool> {
        super::ensure_transition(id, from, to)?;
        let result = sqlx::query(
            r#"
            UPDATE positions SET
                status = $3,
                exit_price = COALESCE($4, exit_price),
                exit_reason = COALESCE($5, exit_reason),
                exited_at = COALESCE($6, exited_at),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_i16())
        .bind(to.as_i16())
        .bind(patch.exit_price)
        .bind(patch.exit_reason)
        .bind(patch.exited_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_pnl(&self, snapshot: &PnlSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions SET
                current_price = $2,
                pnl = $3,
                pnl_pct = $4,
                peak_pnl_pct = GREATEST(peak_pnl_pct, $5),
                high_water_mark = GREATEST(high_water_mark, $6),
                last_price_at = $7,
                updated_at = NOW()
            WHERE id = $1 AND status IN ($8, $9)
            "#,
        )
        .bind(snapshot.position_id)
        .bind(snapshot.last_price)
        .bind(snapshot.pnl)
        .bind(snapshot.pnl_pct)
        .bind(snapshot.peak_pnl_pct)
        .bind(snapshot.high_water_mark)
        .bind(snapshot.timestamp)
        .bind(PositionStatus::Active.as_i16())
        .bind(PositionStatus::Exiting.as_i16())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_stop(
        &self,
        id: Uuid,
        stop_price: Decimal,
        trailing_tier: Option<usize>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions SET
                stop_price = $2,
                trailing_tier = $3,
                updated_at = NOW()
            WHERE id = $1 AND status IN ($4, $5)
            "#,
        )
        .bind(id)
        .bind(stop_price)
        .bind(trailing_tier.map(|t| t as i32))
        .bind(PositionStatus::Active.as_i16())
        .bind(PositionStatus::Exiting.as_i16())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
