use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use common::{Error, LogLevel, Position, PositionSide, PositionStatus, Result};

/// Durable position and log storage behind the paper broker.
///
/// `insert_position` must fail with `Error::UniqueViolation` when an open
/// position already exists for the (project, symbol) pair, so the broker
/// can treat a lost race as "already open".
#[async_trait]
pub trait Ledger: Send + Sync {
    /// The open position for (project, symbol), if any.
    async fn open_position(&self, project_id: Uuid, symbol: &str) -> Result<Option<Position>>;

    async fn insert_position(&self, position: &Position) -> Result<()>;

    /// Partial close: shrink qty in place and accumulate realized PnL.
    async fn reduce_position(
        &self,
        id: Uuid,
        new_qty: f64,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        realized_pnl: f64,
    ) -> Result<()>;

    /// Full close: terminal state for the row.
    async fn close_position(
        &self,
        id: Uuid,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        realized_pnl: f64,
    ) -> Result<()>;

    async fn append_log(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        level: LogLevel,
        message: &str,
        meta: &Value,
    ) -> Result<()>;
}

/// Postgres ledger over `project_positions` and `project_logs`.
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct PositionRow {
    id: Uuid,
    project_id: Uuid,
    user_id: Uuid,
    symbol: String,
    side: String,
    status: String,
    qty: f64,
    entry_price: f64,
    entry_time: DateTime<Utc>,
    exit_price: Option<f64>,
    exit_time: Option<DateTime<Utc>>,
    realized_pnl: f64,
}

impl From<PositionRow> for Position {
    fn from(r: PositionRow) -> Self {
        Position {
            id: r.id,
            project_id: r.project_id,
            user_id: r.user_id,
            symbol: r.symbol,
            side: if r.side == "short" {
                PositionSide::Short
            } else {
                PositionSide::Long
            },
            status: if r.status == "closed" {
                PositionStatus::Closed
            } else {
                PositionStatus::Open
            },
            qty: r.qty,
            entry_price: r.entry_price,
            entry_time: r.entry_time,
            exit_price: r.exit_price,
            exit_time: r.exit_time,
            realized_pnl: r.realized_pnl,
        }
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn open_position(&self, project_id: Uuid, symbol: &str) -> Result<Option<Position>> {
        let row: Option<PositionRow> = sqlx::query_as(
            "SELECT id, project_id, user_id, symbol, side, status, qty, entry_price,
                    entry_time, exit_price, exit_time, realized_pnl
             FROM project_positions
             WHERE project_id = $1 AND symbol = $2 AND status = 'open'",
        )
        .bind(project_id)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Position::from))
    }

    async fn insert_position(&self, p: &Position) -> Result<()> {
        sqlx::query(
            "INSERT INTO project_positions
             (id, project_id, user_id, symbol, side, status, qty, entry_price, entry_time, realized_pnl)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(p.id)
        .bind(p.project_id)
        .bind(p.user_id)
        .bind(&p.symbol)
        .bind(p.side.to_string())
        .bind("open")
        .bind(p.qty)
        .bind(p.entry_price)
        .bind(p.entry_time)
        .bind(p.realized_pnl)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;
        Ok(())
    }

    async fn reduce_position(
        &self,
        id: Uuid,
        new_qty: f64,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        realized_pnl: f64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE project_positions
             SET qty = $2, exit_price = $3, exit_time = $4, realized_pnl = $5
             WHERE id = $1",
        )
        .bind(id)
        .bind(new_qty)
        .bind(exit_price)
        .bind(exit_time)
        .bind(realized_pnl)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close_position(
        &self,
        id: Uuid,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        realized_pnl: f64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE project_positions
             SET status = 'closed', exit_price = $2, exit_time = $3, realized_pnl = $4
             WHERE id = $1",
        )
        .bind(id)
        .bind(exit_price)
        .bind(exit_time)
        .bind(realized_pnl)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_log(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        level: LogLevel,
        message: &str,
        meta: &Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO project_logs (id, project_id, user_id, level, message, meta)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(user_id)
        .bind(level.to_string())
        .bind(message)
        .bind(meta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// One captured strategy log line (in-memory ledger only).
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub project_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub meta: Value,
}

/// In-memory ledger with the same uniqueness semantics as the database.
/// Backs broker and sandbox tests.
#[derive(Default)]
pub struct MemLedger {
    positions: std::sync::Mutex<Vec<Position>>,
    logs: std::sync::Mutex<Vec<LogEntry>>,
}

impl MemLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.positions.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Ledger for MemLedger {
    async fn open_position(&self, project_id: Uuid, symbol: &str) -> Result<Option<Position>> {
        let positions = self.positions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(positions
            .iter()
            .find(|p| {
                p.project_id == project_id
                    && p.symbol == symbol
                    && p.status == PositionStatus::Open
            })
            .cloned())
    }

    async fn insert_position(&self, position: &Position) -> Result<()> {
        let mut positions =
            self.positions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let open_exists = positions.iter().any(|p| {
            p.project_id == position.project_id
                && p.symbol == position.symbol
                && p.status == PositionStatus::Open
        });
        if open_exists {
            return Err(Error::UniqueViolation);
        }
        positions.push(position.clone());
        Ok(())
    }

    async fn reduce_position(
        &self,
        id: Uuid,
        new_qty: f64,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        realized_pnl: f64,
    ) -> Result<()> {
        let mut positions =
            self.positions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(p) = positions.iter_mut().find(|p| p.id == id) {
            p.qty = new_qty;
            p.exit_price = Some(exit_price);
            p.exit_time = Some(exit_time);
            p.realized_pnl = realized_pnl;
        }
        Ok(())
    }

    async fn close_position(
        &self,
        id: Uuid,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        realized_pnl: f64,
    ) -> Result<()> {
        let mut positions =
            self.positions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(p) = positions.iter_mut().find(|p| p.id == id) {
            p.status = PositionStatus::Closed;
            p.exit_price = Some(exit_price);
            p.exit_time = Some(exit_time);
            p.realized_pnl = realized_pnl;
        }
        Ok(())
    }

    async fn append_log(
        &self,
        project_id: Uuid,
        _user_id: Uuid,
        level: LogLevel,
        message: &str,
        meta: &Value,
    ) -> Result<()> {
        self.logs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(LogEntry {
                project_id,
                level,
                message: message.to_string(),
                meta: meta.clone(),
            });
        Ok(())
    }
}
