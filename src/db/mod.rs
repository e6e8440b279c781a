//! Database persistence for scalper state.
//!
//! Stores everything needed to resume after restart:
//! - Session state (symbol, mode, last poll, running flag)
//! - The singleton position, tagged with the symbol it is held in
//! - The append-only trade log
//!
//! Decimals are stored as TEXT so they round-trip exactly.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::str::FromStr;

use crate::models::{Position, TradeRecord, TradeSide};

/// Durable storage behind the decision loop.
///
/// A failed call means the state on disk is unchanged; the caller must treat
/// it as fatal and never keep going on in-memory state alone.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the persisted position, or `None` on first start.
    async fn load_position(&self) -> Result<Option<SavedPosition>>;

    /// Persist the new position and its trade record atomically. The position
    /// is stored under the trade's symbol.
    async fn commit_fill(&self, position: &Position, trade: &TradeRecord) -> Result<()>;

    /// Full trade log, oldest first.
    async fn trades(&self) -> Result<Vec<TradeRecord>>;

    /// Record a new session start.
    async fn start_session(&self, symbol: &str, live: bool) -> Result<()>;

    /// Record a completed poll.
    async fn heartbeat(&self) -> Result<()>;

    /// Mark the session as stopped.
    async fn mark_stopped(&self) -> Result<()>;
}

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Session state stored in database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BotState {
    pub symbol: String,
    pub live: bool,
    pub is_running: bool,
    pub last_poll_at: Option<String>,
    pub started_at: String,
}

/// Persisted position and the symbol it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedPosition {
    pub symbol: String,
    pub position: Position,
}

/// Stored position row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredPosition {
    symbol: String,
    quantity: String,
    average_cost: String,
    used_capital: String,
    updated_at: String,
}

/// Stored trade row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredTrade {
    id: String,
    timestamp: String,
    side: String,
    symbol: String,
    price: String,
    quantity: String,
    notional: String,
    fee: String,
    realized_pnl: String,
    note: String,
    order_id: Option<String>,
}

impl TryFrom<StoredPosition> for SavedPosition {
    type Error = anyhow::Error;

    fn try_from(row: StoredPosition) -> Result<Self> {
        let position = Position {
            quantity: parse_decimal("quantity", &row.quantity)?,
            average_cost: parse_decimal("average_cost", &row.average_cost)?,
            used_capital: parse_decimal("used_capital", &row.used_capital)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        };

        Ok(SavedPosition {
            symbol: row.symbol,
            position,
        })
    }
}

impl TryFrom<StoredTrade> for TradeRecord {
    type Error = anyhow::Error;

    fn try_from(row: StoredTrade) -> Result<Self> {
        let side = TradeSide::parse(&row.side)
            .ok_or_else(|| anyhow!("Invalid side '{}' for trade {}", row.side, row.id))?;

        Ok(TradeRecord {
            timestamp: parse_timestamp(&row.timestamp)?,
            side,
            symbol: row.symbol,
            price: parse_decimal("price", &row.price)?,
            quantity: parse_decimal("quantity", &row.quantity)?,
            notional: parse_decimal("notional", &row.notional)?,
            fee: parse_decimal("fee", &row.fee)?,
            realized_pnl: parse_decimal("realized_pnl", &row.realized_pnl)?,
            note: row.note,
            order_id: row.order_id,
            id: row.id,
        })
    }
}

fn parse_decimal(column: &str, value: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("Invalid decimal in {}: '{}'", column, value))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp '{}'", value))?
        .with_timezone(&Utc))
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// In-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Session state
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                symbol TEXT NOT NULL,
                live INTEGER NOT NULL DEFAULT 0,
                is_running INTEGER NOT NULL DEFAULT 0,
                last_poll_at TEXT,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Singleton position
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS position_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                symbol TEXT NOT NULL,
                quantity TEXT NOT NULL,
                average_cost TEXT NOT NULL,
                used_capital TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Trade log
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                timestamp TEXT NOT NULL,
                side TEXT NOT NULL,
                symbol TEXT NOT NULL,
                price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                notional TEXT NOT NULL,
                fee TEXT NOT NULL DEFAULT '0',
                realized_pnl TEXT NOT NULL DEFAULT '0',
                note TEXT NOT NULL DEFAULT '',
                order_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_time ON trades(timestamp)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Bot State ====================

    /// Get current session state, if a session was ever started.
    pub async fn get_bot_state(&self) -> Result<Option<BotState>> {
        sqlx::query_as::<_, BotState>(
            "SELECT symbol, live, is_running, last_poll_at, started_at FROM bot_state WHERE id = 1",
        )
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read bot state")
    }
}

#[async_trait]
impl StateStore for Database {
    async fn load_position(&self) -> Result<Option<SavedPosition>> {
        let row = sqlx::query_as::<_, StoredPosition>(
            r#"
            SELECT symbol, quantity, average_cost, used_capital, updated_at
            FROM position_state WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load position")?;

        row.map(SavedPosition::try_from).transpose()
    }

    async fn commit_fill(&self, position: &Position, trade: &TradeRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            r#"
            INSERT INTO trades (
                id, timestamp, side, symbol, price, quantity,
                notional, fee, realized_pnl, note, order_id
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.id)
        .bind(format_timestamp(&trade.timestamp))
        .bind(trade.side.as_str())
        .bind(&trade.symbol)
        .bind(trade.price.to_string())
        .bind(trade.quantity.to_string())
        .bind(trade.notional.to_string())
        .bind(trade.fee.to_string())
        .bind(trade.realized_pnl.to_string())
        .bind(&trade.note)
        .bind(&trade.order_id)
        .execute(&mut *tx)
        .await
        .context("Failed to append trade")?;

        sqlx::query(
            r#"
            INSERT INTO position_state
                (id, symbol, quantity, average_cost, used_capital, updated_at)
            VALUES (1, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                symbol = excluded.symbol,
                quantity = excluded.quantity,
                average_cost = excluded.average_cost,
                used_capital = excluded.used_capital,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&trade.symbol)
        .bind(position.quantity.to_string())
        .bind(position.average_cost.to_string())
        .bind(position.used_capital.to_string())
        .bind(format_timestamp(&position.updated_at))
        .execute(&mut *tx)
        .await
        .context("Failed to save position")?;

        tx.commit().await.context("Failed to commit fill")?;
        Ok(())
    }

    async fn trades(&self) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query_as::<_, StoredTrade>(
            r#"
            SELECT id, timestamp, side, symbol, price, quantity,
                   notional, fee, realized_pnl, note, order_id
            FROM trades ORDER BY seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load trades")?;

        rows.into_iter().map(TradeRecord::try_from).collect()
    }

    async fn start_session(&self, symbol: &str, live: bool) -> Result<()> {
        let now = format_timestamp(&Utc::now());
        sqlx::query(
            r#"
            INSERT INTO bot_state (id, symbol, live, is_running, started_at, updated_at)
            VALUES (1, ?, ?, 1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                symbol = excluded.symbol,
                live = excluded.live,
                is_running = 1,
                last_poll_at = NULL,
                started_at = excluded.started_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(symbol)
        .bind(live)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to record session start")?;

        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        let now = format_timestamp(&Utc::now());
        sqlx::query("UPDATE bot_state SET last_poll_at = ?, updated_at = ? WHERE id = 1")
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await
            .context("Failed to record heartbeat")?;
        Ok(())
    }

    async fn mark_stopped(&self) -> Result<()> {
        sqlx::query("UPDATE bot_state SET is_running = 0, updated_at = ? WHERE id = 1")
            .bind(format_timestamp(&Utc::now()))
            .execute(&self.pool)
            .await
            .context("Failed to mark bot stopped")?;
        Ok(())
    }
}
