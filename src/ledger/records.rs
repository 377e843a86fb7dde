//! Side records kept next to the ledger: completed payments, appeals and
//! arbitration run audits.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tx::{invalid_column, is_constraint_violation, parse_ts, parse_uuid, LedgerTx};
use crate::errors::{MarketError, MarketResult};

/// A processed checkout session. One row per session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub checkout_session_id: String,
    pub payment_intent_id: Option<String>,
    pub package_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub credits: f64,
    pub customer_email: Option<String>,
    pub status: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppealStatus {
    Pending,
    Reviewing,
    Approved,
    Rejected,
}

impl AppealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppealStatus::Pending => "pending",
            AppealStatus::Reviewing => "reviewing",
            AppealStatus::Approved => "approved",
            AppealStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Some(AppealStatus::Pending),
            "reviewing" => Some(AppealStatus::Reviewing),
            "approved" => Some(AppealStatus::Approved),
            "rejected" => Some(AppealStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, AppealStatus::Pending | AppealStatus::Reviewing)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appeal {
    pub id: Uuid,
    pub market_id: Uuid,
    pub user_id: Uuid,
    pub reason: String,
    pub status: AppealStatus,
    pub admin_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
}

/// Audit row for one completed arbitration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrationRun {
    pub id: Uuid,
    pub market_id: Uuid,
    pub resolution_status: String,
    pub search_count: i64,
    pub queries: Vec<String>,
    pub sources: serde_json::Value,
    pub transcript_sha256: String,
    pub created_at: DateTime<Utc>,
}

impl<'a> LedgerTx<'a> {
    // ===== Payments =====

    pub fn payment_exists(&self, checkout_session_id: &str) -> MarketResult<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM payment_transactions WHERE checkout_session_id = ?1",
                params![checkout_session_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns false when the session was already recorded.
    pub fn insert_payment(&self, payment: &PaymentRecord) -> MarketResult<bool> {
        let result = self.conn().execute(
            "INSERT INTO payment_transactions
                (id, user_id, checkout_session_id, payment_intent_id, package_id, amount_cents,
                 currency, credits, customer_email, status, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                payment.id.to_string(),
                payment.user_id.to_string(),
                payment.checkout_session_id,
                payment.payment_intent_id,
                payment.package_id,
                payment.amount_cents,
                payment.currency,
                payment.credits,
                payment.customer_email,
                payment.status,
                payment.completed_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_constraint_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // ===== Appeals =====

    pub fn insert_appeal(&self, appeal: &Appeal) -> MarketResult<()> {
        let result = self.conn().execute(
            "INSERT INTO appeals (id, market_id, user_id, reason, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                appeal.id.to_string(),
                appeal.market_id.to_string(),
                appeal.user_id.to_string(),
                appeal.reason,
                appeal.status.as_str(),
                appeal.created_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(MarketError::AppealExists),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_appeal(&self, appeal_id: Uuid) -> MarketResult<Option<Appeal>> {
        let appeal = self
            .conn()
            .query_row(
                "SELECT id, market_id, user_id, reason, status, admin_notes, created_at,
                        resolved_at, resolved_by
                 FROM appeals WHERE id = ?1",
                params![appeal_id.to_string()],
                appeal_from_row,
            )
            .optional()?;
        Ok(appeal)
    }

    /// Newest first. `user_id = None` lists every user's appeals.
    pub fn list_appeals(
        &self,
        user_id: Option<Uuid>,
        status: Option<AppealStatus>,
        limit: usize,
        offset: usize,
    ) -> MarketResult<Vec<Appeal>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, market_id, user_id, reason, status, admin_notes, created_at,
                    resolved_at, resolved_by
             FROM appeals
             WHERE (?1 IS NULL OR user_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC
             LIMIT ?3 OFFSET ?4",
        )?;
        let appeals = stmt
            .query_map(
                params![
                    user_id.map(|id| id.to_string()),
                    status.map(|s| s.as_str()),
                    limit as i64,
                    offset as i64,
                ],
                appeal_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(appeals)
    }

    /// Close an open appeal. Returns false if it was no longer open.
    pub fn close_appeal(
        &self,
        appeal_id: Uuid,
        status: AppealStatus,
        admin_notes: &str,
        resolved_by: Uuid,
        resolved_at: DateTime<Utc>,
    ) -> MarketResult<bool> {
        let changed = self.conn().execute(
            "UPDATE appeals SET status = ?1, admin_notes = ?2, resolved_by = ?3, resolved_at = ?4
             WHERE id = ?5 AND status IN ('pending', 'reviewing')",
            params![
                status.as_str(),
                admin_notes,
                resolved_by.to_string(),
                resolved_at.to_rfc3339(),
                appeal_id.to_string(),
            ],
        )?;
        Ok(changed == 1)
    }

    // ===== Arbitration runs =====

    pub fn insert_arbitration_run(&self, run: &ArbitrationRun) -> MarketResult<()> {
        let queries = serde_json::to_string(&run.queries).map_err(anyhow::Error::from)?;
        let sources = serde_json::to_string(&run.sources).map_err(anyhow::Error::from)?;
        self.conn().execute(
            "INSERT INTO arbitration_runs
                (id, market_id, resolution_status, search_count, queries_json, sources_json,
                 transcript_sha256, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.id.to_string(),
                run.market_id.to_string(),
                run.resolution_status,
                run.search_count,
                queries,
                sources,
                run.transcript_sha256,
                run.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_arbitration_runs(&self, market_id: Uuid) -> MarketResult<Vec<ArbitrationRun>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, market_id, resolution_status, search_count, queries_json, sources_json,
                    transcript_sha256, created_at
             FROM arbitration_runs WHERE market_id = ?1 ORDER BY created_at ASC",
        )?;
        let runs = stmt
            .query_map(params![market_id.to_string()], |row| {
                let queries: String = row.get(4)?;
                let sources: String = row.get(5)?;
                Ok(ArbitrationRun {
                    id: parse_uuid(0, row.get(0)?)?,
                    market_id: parse_uuid(1, row.get(1)?)?,
                    resolution_status: row.get(2)?,
                    search_count: row.get(3)?,
                    queries: serde_json::from_str(&queries)
                        .map_err(|_| invalid_column(4, "bad queries json"))?,
                    sources: serde_json::from_str(&sources)
                        .map_err(|_| invalid_column(5, "bad sources json"))?,
                    transcript_sha256: row.get(6)?,
                    created_at: parse_ts(7, row.get(7)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}

fn appeal_from_row(row: &Row<'_>) -> rusqlite::Result<Appeal> {
    let status: String = row.get(4)?;
    let resolved_at: Option<String> = row.get(7)?;
    let resolved_by: Option<String> = row.get(8)?;
    Ok(Appeal {
        id: parse_uuid(0, row.get(0)?)?,
        market_id: parse_uuid(1, row.get(1)?)?,
        user_id: parse_uuid(2, row.get(2)?)?,
        reason: row.get(3)?,
        status: AppealStatus::from_str(&status)
            .ok_or_else(|| invalid_column(4, "unknown appeal status"))?,
        admin_notes: row.get(5)?,
        created_at: parse_ts(6, row.get(6)?)?,
        resolved_at: resolved_at.map(|ts| parse_ts(7, ts)).transpose()?,
        resolved_by: resolved_by.map(|id| parse_uuid(8, id)).transpose()?,
    })
}
