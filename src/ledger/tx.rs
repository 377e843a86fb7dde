use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::errors::{MarketError, MarketResult};
use crate::models::{
    ArbitratorType, CreditTransaction, Market, MarketState, Position, ResolutionDecision, Side,
    TransactionKind, UserRole,
};

/// Tolerance applied to balance guards so float dust never blocks a full withdrawal.
const BALANCE_EPSILON: f64 = 1e-9;

/// Ledger operations bound to one open transaction (see `LedgerDb::atomic`).
pub struct LedgerTx<'a> {
    conn: &'a Connection,
}

impl<'a> LedgerTx<'a> {
    pub(crate) fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub(crate) fn conn(&self) -> &Connection {
        self.conn
    }

    // ===== Users & balances =====

    /// Register a principal on first sight; refresh the email when one is supplied.
    pub fn ensure_user(&self, user_id: Uuid, email: Option<&str>, role: UserRole) -> MarketResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO users (id, email, role, balance, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0.0, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                email = COALESCE(excluded.email, users.email),
                updated_at = excluded.updated_at",
            params![user_id.to_string(), email, role.as_str(), now],
        )?;
        Ok(())
    }

    pub fn get_balance(&self, user_id: Uuid) -> MarketResult<Option<f64>> {
        let balance = self
            .conn
            .query_row(
                "SELECT balance FROM users WHERE id = ?1",
                params![user_id.to_string()],
                |row| row.get::<_, f64>(0),
            )
            .optional()?;
        Ok(balance)
    }

    /// Apply a signed delta to a balance and return the new balance.
    ///
    /// The non-negativity check lives in the UPDATE itself, so a debit is
    /// re-validated at write time rather than trusting an earlier read.
    pub fn update_user_balance(&self, user_id: Uuid, delta: f64) -> MarketResult<f64> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE users SET balance = balance + ?1, updated_at = ?2
             WHERE id = ?3 AND balance + ?1 >= ?4",
            params![delta, now, user_id.to_string(), -BALANCE_EPSILON],
        )?;

        if changed == 0 {
            return match self.get_balance(user_id)? {
                None => Err(MarketError::UserNotFound),
                Some(available) => Err(MarketError::InsufficientBalance {
                    available,
                    required: -delta,
                }),
            };
        }

        self.get_balance(user_id)?.ok_or(MarketError::UserNotFound)
    }

    // ===== Markets =====

    pub fn insert_market(&self, market: &Market) -> MarketResult<()> {
        self.conn.execute(
            "INSERT INTO markets (id, title, description, deadline, arbitrator_type, arbitrator_email,
                minimum_stake, creator_id, status, resolved, outcome, pool_for, pool_against,
                pool_total, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                market.id.to_string(),
                market.title,
                market.description,
                market.deadline.to_rfc3339(),
                market.arbitrator_type.as_str(),
                market.arbitrator_email,
                market.minimum_stake,
                market.creator_id.to_string(),
                market.state.status_str(),
                market.state.is_settled() as i64,
                market.state.outcome().map(|s| s.as_str()),
                market.pool_for,
                market.pool_against,
                market.pool_total(),
                market.created_at.to_rfc3339(),
                market.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_market(&self, market_id: Uuid) -> MarketResult<Option<Market>> {
        let market = self
            .conn
            .query_row(
                "SELECT id, title, description, deadline, arbitrator_type, arbitrator_email,
                        minimum_stake, creator_id, status, outcome, pool_for, pool_against,
                        created_at, updated_at
                 FROM markets WHERE id = ?1",
                params![market_id.to_string()],
                market_from_row,
            )
            .optional()?;
        Ok(market)
    }

    pub fn require_market(&self, market_id: Uuid) -> MarketResult<Market> {
        self.get_market(market_id)?.ok_or(MarketError::MarketNotFound)
    }

    /// Add a stake to the matching pool and the pool total.
    pub fn update_market_pools(&self, market_id: Uuid, side: Side, amount: f64) -> MarketResult<()> {
        let (add_for, add_against) = match side {
            Side::Yes => (amount, 0.0),
            Side::No => (0.0, amount),
        };
        let changed = self.conn.execute(
            "UPDATE markets SET
                pool_for = pool_for + ?1,
                pool_against = pool_against + ?2,
                pool_total = pool_total + ?1 + ?2,
                updated_at = ?3
             WHERE id = ?4 AND status = 'active'",
            params![add_for, add_against, Utc::now().to_rfc3339(), market_id.to_string()],
        )?;
        if changed == 0 {
            return Err(MarketError::MarketClosed);
        }
        Ok(())
    }

    /// Move an active market into a terminal state. Returns false if it was
    /// no longer active (someone settled it first).
    pub fn update_market_state(&self, market_id: Uuid, state: MarketState) -> MarketResult<bool> {
        let changed = self.conn.execute(
            "UPDATE markets SET status = ?1, resolved = ?2, outcome = ?3, updated_at = ?4
             WHERE id = ?5 AND status = 'active'",
            params![
                state.status_str(),
                state.is_settled() as i64,
                state.outcome().map(|s| s.as_str()),
                Utc::now().to_rfc3339(),
                market_id.to_string(),
            ],
        )?;
        Ok(changed == 1)
    }

    // ===== Positions =====

    pub fn insert_position(&self, position: &Position) -> MarketResult<()> {
        self.conn.execute(
            "INSERT INTO positions (id, market_id, user_id, side, amount, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                position.id.to_string(),
                position.market_id.to_string(),
                position.user_id.to_string(),
                position.side.as_str(),
                position.amount,
                position.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_positions(&self, market_id: Uuid) -> MarketResult<Vec<Position>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, market_id, user_id, side, amount, created_at
             FROM positions WHERE market_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let positions = stmt
            .query_map(params![market_id.to_string()], position_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(positions)
    }

    pub fn has_position(&self, market_id: Uuid, user_id: Uuid) -> MarketResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM positions WHERE market_id = ?1 AND user_id = ?2",
            params![market_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Count and total of a user's stakes in markets that are still active.
    pub fn open_stakes(&self, user_id: Uuid) -> MarketResult<(i64, f64)> {
        let stats = self.conn.query_row(
            "SELECT COUNT(p.id), COALESCE(SUM(p.amount), 0.0)
             FROM positions p JOIN markets m ON m.id = p.market_id
             WHERE p.user_id = ?1 AND m.status = 'active'",
            params![user_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(stats)
    }

    // ===== Credit transactions =====

    /// Append an audit record. A second payout/refund for the same stake is refused.
    pub fn insert_credit_transaction(&self, tx: &CreditTransaction) -> MarketResult<()> {
        let result = self.conn.execute(
            "INSERT INTO credit_transactions
                (id, user_id, amount, kind, description, market_id, position_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tx.id.to_string(),
                tx.user_id.to_string(),
                tx.amount,
                tx.kind.as_str(),
                tx.description,
                tx.market_id.map(|id| id.to_string()),
                tx.position_id.map(|id| id.to_string()),
                tx.created_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) && tx.position_id.is_some() => {
                Err(MarketError::DuplicateSettlement {
                    position_id: tx.position_id.map(|id| id.to_string()).unwrap_or_default(),
                    kind: tx.kind.as_str().to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_transactions(&self, user_id: Uuid, limit: usize) -> MarketResult<Vec<CreditTransaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, amount, kind, description, market_id, position_id, created_at
             FROM credit_transactions WHERE user_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let txs = stmt
            .query_map(params![user_id.to_string(), limit as i64], credit_tx_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(txs)
    }

    /// Balance as reconstructed from the append-only history.
    pub fn sum_transactions(&self, user_id: Uuid) -> MarketResult<f64> {
        let sum = self.conn.query_row(
            "SELECT COALESCE(SUM(amount), 0.0) FROM credit_transactions WHERE user_id = ?1",
            params![user_id.to_string()],
            |row| row.get::<_, f64>(0),
        )?;
        Ok(sum)
    }

    /// Positions of a market that already received a transaction of `kind`.
    pub fn settled_position_ids(&self, market_id: Uuid, kind: TransactionKind) -> MarketResult<Vec<Uuid>> {
        let mut stmt = self.conn.prepare(
            "SELECT position_id FROM credit_transactions
             WHERE market_id = ?1 AND kind = ?2 AND position_id IS NOT NULL",
        )?;
        let ids = stmt
            .query_map(params![market_id.to_string(), kind.as_str()], |row| {
                parse_uuid(0, row.get(0)?)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    // ===== Resolution decisions =====

    /// Insert the decision row. The UNIQUE(market_id) constraint turns a lost
    /// race into `AlreadyResolved`.
    pub fn insert_resolution_decision(&self, decision: &ResolutionDecision) -> MarketResult<()> {
        let result = self.conn.execute(
            "INSERT INTO resolution_decisions
                (id, market_id, outcome, arbitrator_id, reasoning, total_payout, winners_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                decision.id.to_string(),
                decision.market_id.to_string(),
                decision.outcome.as_str(),
                decision.arbitrator_id.to_string(),
                decision.reasoning,
                decision.total_payout,
                decision.winners_count,
                decision.created_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(MarketError::AlreadyResolved),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_resolution_decision(&self, market_id: Uuid) -> MarketResult<Option<ResolutionDecision>> {
        let decision = self
            .conn
            .query_row(
                "SELECT id, market_id, outcome, arbitrator_id, reasoning, total_payout,
                        winners_count, created_at
                 FROM resolution_decisions WHERE market_id = ?1",
                params![market_id.to_string()],
                |row| {
                    let outcome: String = row.get(2)?;
                    Ok(ResolutionDecision {
                        id: parse_uuid(0, row.get(0)?)?,
                        market_id: parse_uuid(1, row.get(1)?)?,
                        outcome: Side::from_str(&outcome)
                            .ok_or_else(|| invalid_column(2, "unknown outcome"))?,
                        arbitrator_id: parse_uuid(3, row.get(3)?)?,
                        reasoning: row.get(4)?,
                        total_payout: row.get(5)?,
                        winners_count: row.get(6)?,
                        created_at: parse_ts(7, row.get(7)?)?,
                    })
                },
            )
            .optional()?;
        Ok(decision)
    }
}

// ===== Row mapping =====

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub(crate) fn invalid_column(idx: usize, msg: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::from(msg.to_string()))
}

pub(crate) fn parse_uuid(idx: usize, raw: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn market_from_row(row: &Row<'_>) -> rusqlite::Result<Market> {
    let arbitrator: String = row.get(4)?;
    let status: String = row.get(8)?;
    let outcome: Option<String> = row.get(9)?;

    Ok(Market {
        id: parse_uuid(0, row.get(0)?)?,
        title: row.get(1)?,
        description: row.get(2)?,
        deadline: parse_ts(3, row.get(3)?)?,
        arbitrator_type: ArbitratorType::from_str(&arbitrator)
            .ok_or_else(|| invalid_column(4, "unknown arbitrator type"))?,
        arbitrator_email: row.get(5)?,
        minimum_stake: row.get(6)?,
        creator_id: parse_uuid(7, row.get(7)?)?,
        state: MarketState::from_columns(&status, outcome.as_deref())
            .ok_or_else(|| invalid_column(8, "inconsistent status/outcome"))?,
        pool_for: row.get(10)?,
        pool_against: row.get(11)?,
        created_at: parse_ts(12, row.get(12)?)?,
        updated_at: parse_ts(13, row.get(13)?)?,
    })
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    let side: String = row.get(3)?;
    Ok(Position {
        id: parse_uuid(0, row.get(0)?)?,
        market_id: parse_uuid(1, row.get(1)?)?,
        user_id: parse_uuid(2, row.get(2)?)?,
        side: Side::from_str(&side).ok_or_else(|| invalid_column(3, "unknown side"))?,
        amount: row.get(4)?,
        created_at: parse_ts(5, row.get(5)?)?,
    })
}

fn credit_tx_from_row(row: &Row<'_>) -> rusqlite::Result<CreditTransaction> {
    let kind: String = row.get(3)?;
    let market_id: Option<String> = row.get(5)?;
    let position_id: Option<String> = row.get(6)?;
    Ok(CreditTransaction {
        id: parse_uuid(0, row.get(0)?)?,
        user_id: parse_uuid(1, row.get(1)?)?,
        amount: row.get(2)?,
        kind: TransactionKind::from_str(&kind)
            .ok_or_else(|| invalid_column(3, "unknown transaction kind"))?,
        description: row.get(4)?,
        market_id: market_id.map(|id| parse_uuid(5, id)).transpose()?,
        position_id: position_id.map(|id| parse_uuid(6, id)).transpose()?,
        created_at: parse_ts(7, row.get(7)?)?,
    })
}
