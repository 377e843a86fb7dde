//! Ledger Store
//!
//! Balances, markets, positions and the append-only credit history, persisted
//! in SQLite. Multi-row mutations run inside [`LedgerDb::atomic`].

mod db;
mod queries;
mod records;
mod tx;

pub use db::LedgerDb;
pub use queries::{Comment, MarketListFilter, PositionStats, PositionSummary, StatusFilter};
pub use records::{Appeal, AppealStatus, ArbitrationRun, PaymentRecord};
pub use tx::LedgerTx;

use serde::Serialize;
use uuid::Uuid;

use crate::errors::MarketResult;

/// Drift below this is float noise, not a missing transaction.
pub const AUDIT_TOLERANCE: f64 = 1e-6;

/// Per-credit drift allowed on very large balances.
pub const AUDIT_RELATIVE_TOLERANCE: f64 = 1e-12;

/// Stored balance versus the balance rebuilt from credit transactions.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceAudit {
    pub stored_balance: f64,
    pub reconstructed_balance: f64,
    pub drift: f64,
    pub consistent: bool,
}

impl<'a> LedgerTx<'a> {
    pub fn audit_balance(&self, user_id: Uuid) -> MarketResult<BalanceAudit> {
        let stored_balance = self
            .get_balance(user_id)?
            .ok_or(crate::errors::MarketError::UserNotFound)?;
        let reconstructed_balance = self.sum_transactions(user_id)?;
        let drift = stored_balance - reconstructed_balance;
        Ok(BalanceAudit {
            stored_balance,
            reconstructed_balance,
            drift,
            consistent: drift.abs()
                <= AUDIT_TOLERANCE.max(stored_balance.abs() * AUDIT_RELATIVE_TOLERANCE),
        })
    }
}
