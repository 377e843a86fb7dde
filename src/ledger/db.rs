use anyhow::{Context, Result};
use rusqlite::{Connection, TransactionBehavior};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::MarketResult;
use crate::ledger::LedgerTx;

/// SQLite-backed ledger: balances, markets, positions and the audit trail.
///
/// One connection guarded by an async mutex. Every multi-row mutation goes
/// through [`LedgerDb::atomic`], which wraps it in an IMMEDIATE transaction so
/// that either all of its writes land or none do.
#[derive(Clone)]
pub struct LedgerDb {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerDb {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open ledger db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory ledger db")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enable foreign keys")?;
        init_schema(&conn)?;
        debug!("ledger schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` as one atomic unit. Commits on `Ok`, rolls back on `Err`.
    pub async fn atomic<T, F>(&self, f: F) -> MarketResult<T>
    where
        F: FnOnce(&LedgerTx<'_>) -> MarketResult<T>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&LedgerTx::new(&tx))?;
        tx.commit()?;
        Ok(out)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT,
            role TEXT NOT NULL DEFAULT 'user',
            balance REAL NOT NULL DEFAULT 0.0 CHECK (balance >= -0.000001),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS markets (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            deadline TEXT NOT NULL,
            arbitrator_type TEXT NOT NULL,
            arbitrator_email TEXT,
            minimum_stake REAL NOT NULL,
            creator_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            resolved INTEGER NOT NULL DEFAULT 0,
            outcome TEXT,
            pool_for REAL NOT NULL DEFAULT 0.0,
            pool_against REAL NOT NULL DEFAULT 0.0,
            pool_total REAL NOT NULL DEFAULT 0.0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (creator_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS positions (
            id TEXT PRIMARY KEY,
            market_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            side TEXT NOT NULL,
            amount REAL NOT NULL CHECK (amount > 0),
            created_at TEXT NOT NULL,
            FOREIGN KEY (market_id) REFERENCES markets(id),
            FOREIGN KEY (user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS credit_transactions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            amount REAL NOT NULL,
            kind TEXT NOT NULL,
            description TEXT NOT NULL,
            market_id TEXT,
            position_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id)
        )",
        [],
    )?;

    // A stake is paid out or refunded at most once.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_credit_tx_position_kind
         ON credit_transactions(position_id, kind) WHERE position_id IS NOT NULL",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS resolution_decisions (
            id TEXT PRIMARY KEY,
            market_id TEXT NOT NULL UNIQUE,
            outcome TEXT NOT NULL,
            arbitrator_id TEXT NOT NULL,
            reasoning TEXT,
            total_payout REAL NOT NULL,
            winners_count INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (market_id) REFERENCES markets(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payment_transactions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            checkout_session_id TEXT NOT NULL UNIQUE,
            payment_intent_id TEXT,
            package_id TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            currency TEXT NOT NULL,
            credits REAL NOT NULL,
            customer_email TEXT,
            status TEXT NOT NULL,
            completed_at TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS appeals (
            id TEXT PRIMARY KEY,
            market_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            reason TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            admin_notes TEXT,
            created_at TEXT NOT NULL,
            resolved_at TEXT,
            resolved_by TEXT,
            UNIQUE (market_id, user_id),
            FOREIGN KEY (market_id) REFERENCES markets(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS arbitration_runs (
            id TEXT PRIMARY KEY,
            market_id TEXT NOT NULL,
            resolution_status TEXT NOT NULL,
            search_count INTEGER NOT NULL,
            queries_json TEXT NOT NULL,
            sources_json TEXT NOT NULL,
            transcript_sha256 TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS market_comments (
            id TEXT PRIMARY KEY,
            market_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            content TEXT NOT NULL,
            parent_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            FOREIGN KEY (market_id) REFERENCES markets(id),
            FOREIGN KEY (user_id) REFERENCES users(id),
            FOREIGN KEY (parent_id) REFERENCES market_comments(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_positions_market ON positions(market_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_positions_user ON positions(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_credit_tx_user_ts ON credit_transactions(user_id, created_at DESC)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_appeals_user_ts ON appeals(user_id, created_at DESC)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_markets_created ON markets(created_at DESC)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_comments_thread
         ON market_comments(market_id, parent_id, created_at DESC)",
        [],
    )?;

    Ok(())
}
