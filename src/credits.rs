//! Credit purchases, admin adjustments and balance summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{MarketError, MarketResult};
use crate::ledger::{BalanceAudit, LedgerDb, PaymentRecord};
use crate::models::{CreditTransaction, Principal, TransactionKind, UserRole};

/// Upper bound for a single admin credit grant.
pub const MAX_ADMIN_ADJUSTMENT: f64 = 10_000.0;
pub const RECENT_TRANSACTIONS: usize = 10;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CreditPackage {
    pub id: &'static str,
    pub credits: f64,
    pub price_cents: i64,
}

pub const CREDIT_PACKAGES: [CreditPackage; 4] = [
    CreditPackage {
        id: "credits_100",
        credits: 100.0,
        price_cents: 1_000,
    },
    CreditPackage {
        id: "credits_500",
        credits: 500.0,
        price_cents: 4_000,
    },
    CreditPackage {
        id: "credits_1000",
        credits: 1000.0,
        price_cents: 7_500,
    },
    CreditPackage {
        id: "credits_2500",
        credits: 2500.0,
        price_cents: 17_500,
    },
];

pub fn find_package(id: &str) -> Option<&'static CreditPackage> {
    CREDIT_PACKAGES.iter().find(|p| p.id == id)
}

/// A payment the processor has already verified.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentCompleted {
    pub checkout_session_id: String,
    #[serde(default)]
    pub payment_intent_id: Option<String>,
    pub user_id: Uuid,
    pub package_id: String,
    pub credits: f64,
    pub amount_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub customer_email: Option<String>,
}

fn default_currency() -> String {
    "usd".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentApplied {
    pub already_processed: bool,
    pub credits_added: f64,
    pub new_balance: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceSummary {
    pub user_id: Uuid,
    pub balance: f64,
    pub recent_transactions: Vec<CreditTransaction>,
    pub open_positions: i64,
    pub total_staked_open: f64,
    pub audit: BalanceAudit,
    pub as_of: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CreditService {
    ledger: LedgerDb,
}

impl CreditService {
    pub fn new(ledger: LedgerDb) -> Self {
        Self { ledger }
    }

    /// Credit a completed purchase. Redelivery of the same checkout session
    /// changes nothing and reports `already_processed`.
    pub async fn apply_payment(&self, event: PaymentCompleted) -> MarketResult<PaymentApplied> {
        let package = find_package(&event.package_id)
            .ok_or_else(|| MarketError::validation("package_id", "unknown credit package"))?;
        if (event.credits - package.credits).abs() > f64::EPSILON {
            return Err(MarketError::validation(
                "credits",
                "credit amount does not match package",
            ));
        }
        if event.amount_cents != package.price_cents {
            return Err(MarketError::validation(
                "amount_cents",
                "paid amount does not match package price",
            ));
        }
        if event.checkout_session_id.trim().is_empty() {
            return Err(MarketError::validation(
                "checkout_session_id",
                "checkout session id is required",
            ));
        }

        let applied = self
            .ledger
            .atomic(|tx| {
                tx.ensure_user(event.user_id, event.customer_email.as_deref(), UserRole::User)?;

                let record = PaymentRecord {
                    id: Uuid::new_v4(),
                    user_id: event.user_id,
                    checkout_session_id: event.checkout_session_id.clone(),
                    payment_intent_id: event.payment_intent_id.clone(),
                    package_id: package.id.to_string(),
                    amount_cents: event.amount_cents,
                    currency: event.currency.clone(),
                    credits: package.credits,
                    customer_email: event.customer_email.clone(),
                    status: "completed".to_string(),
                    completed_at: Utc::now(),
                };

                if tx.payment_exists(&record.checkout_session_id)? || !tx.insert_payment(&record)? {
                    let balance = tx.get_balance(event.user_id)?.unwrap_or(0.0);
                    return Ok(PaymentApplied {
                        already_processed: true,
                        credits_added: 0.0,
                        new_balance: balance,
                    });
                }

                let new_balance = tx.update_user_balance(event.user_id, package.credits)?;
                tx.insert_credit_transaction(&CreditTransaction::new(
                    event.user_id,
                    package.credits,
                    TransactionKind::Purchase,
                    format!("Purchased {} credits", package.credits),
                ))?;

                Ok(PaymentApplied {
                    already_processed: false,
                    credits_added: package.credits,
                    new_balance,
                })
            })
            .await?;

        if applied.already_processed {
            warn!(
                session = %event.checkout_session_id,
                "payment already processed, ignoring redelivery"
            );
        } else {
            info!(
                user_id = %event.user_id,
                package = package.id,
                credits = package.credits,
                "💳 credits purchased"
            );
        }
        Ok(applied)
    }

    pub async fn admin_adjust(
        &self,
        admin: &Principal,
        user_id: Uuid,
        amount: f64,
        description: Option<String>,
    ) -> MarketResult<f64> {
        if !admin.is_admin() {
            return Err(MarketError::AdminRequired);
        }
        if !(amount.is_finite() && amount > 0.0) {
            return Err(MarketError::InvalidAmount("amount must be positive".into()));
        }
        if amount > MAX_ADMIN_ADJUSTMENT {
            return Err(MarketError::InvalidAmount(format!(
                "cannot add more than {} credits at once",
                MAX_ADMIN_ADJUSTMENT
            )));
        }

        let description = description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| format!("Admin credit adjustment: {}", amount));

        let new_balance = self
            .ledger
            .atomic(|tx| {
                let balance = tx.update_user_balance(user_id, amount)?;
                tx.insert_credit_transaction(&CreditTransaction::new(
                    user_id,
                    amount,
                    TransactionKind::AdminAdjustment,
                    description.clone(),
                ))?;
                Ok(balance)
            })
            .await?;

        info!(
            admin = %admin.user_id,
            user_id = %user_id,
            amount,
            new_balance,
            "admin credit adjustment"
        );
        Ok(new_balance)
    }

    pub async fn balance_summary(&self, principal: &Principal) -> MarketResult<BalanceSummary> {
        let summary = self
            .ledger
            .atomic(|tx| {
                tx.ensure_user(principal.user_id, principal.email.as_deref(), principal.role)?;
                let audit = tx.audit_balance(principal.user_id)?;
                let recent_transactions =
                    tx.list_transactions(principal.user_id, RECENT_TRANSACTIONS)?;
                let (open_positions, total_staked_open) = tx.open_stakes(principal.user_id)?;
                Ok(BalanceSummary {
                    user_id: principal.user_id,
                    balance: audit.stored_balance,
                    recent_transactions,
                    open_positions,
                    total_staked_open,
                    audit,
                    as_of: Utc::now(),
                })
            })
            .await?;

        if !summary.audit.consistent {
            warn!(
                user_id = %principal.user_id,
                stored = summary.audit.stored_balance,
                reconstructed = summary.audit.reconstructed_balance,
                "balance drift against transaction history"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn purchase(user_id: Uuid, session: &str) -> PaymentCompleted {
        PaymentCompleted {
            checkout_session_id: session.to_string(),
            payment_intent_id: Some("pi_123".to_string()),
            user_id,
            package_id: "credits_500".to_string(),
            credits: 500.0,
            amount_cents: 4_000,
            currency: "usd".to_string(),
            customer_email: Some("buyer@example.com".to_string()),
        }
    }

    #[tokio::test]
    async fn test_payment_is_applied_once() {
        let service = CreditService::new(LedgerDb::open_in_memory().unwrap());
        let user = Uuid::new_v4();

        let first = service.apply_payment(purchase(user, "cs_1")).await.unwrap();
        assert!(!first.already_processed);
        assert_eq!(first.new_balance, 500.0);

        let again = service.apply_payment(purchase(user, "cs_1")).await.unwrap();
        assert!(again.already_processed);
        assert_eq!(again.credits_added, 0.0);
        assert_eq!(again.new_balance, 500.0);

        let summary = service
            .balance_summary(&Principal::user(user, None))
            .await
            .unwrap();
        assert_eq!(summary.balance, 500.0);
        assert_eq!(summary.recent_transactions.len(), 1);
        assert!(summary.audit.consistent);
    }

    #[tokio::test]
    async fn test_payment_must_match_package() {
        let service = CreditService::new(LedgerDb::open_in_memory().unwrap());
        let mut event = purchase(Uuid::new_v4(), "cs_2");
        event.credits = 5000.0;
        assert!(service.apply_payment(event).await.is_err());

        let mut event = purchase(Uuid::new_v4(), "cs_3");
        event.package_id = "credits_9".to_string();
        assert!(service.apply_payment(event).await.is_err());
    }

    #[tokio::test]
    async fn test_admin_adjust_rules() {
        let service = CreditService::new(LedgerDb::open_in_memory().unwrap());
        let user = Uuid::new_v4();
        service.apply_payment(purchase(user, "cs_4")).await.unwrap();

        let admin = Principal {
            user_id: Uuid::new_v4(),
            email: None,
            role: UserRole::Admin,
        };
        let plain = Principal::user(Uuid::new_v4(), None);

        let err = service.admin_adjust(&plain, user, 10.0, None).await.unwrap_err();
        assert!(matches!(err, MarketError::AdminRequired));

        let err = service
            .admin_adjust(&admin, user, 10_001.0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::InvalidAmount(_)));

        let err = service
            .admin_adjust(&admin, Uuid::new_v4(), 10.0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::UserNotFound));

        let balance = service
            .admin_adjust(&admin, user, 10_000.0, Some("goodwill".into()))
            .await
            .unwrap();
        assert_eq!(balance, 10_500.0);
    }
}
