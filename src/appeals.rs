//! Appeals against settled markets.
//!
//! An appeal is a record for admins to review. Approving one does not touch
//! balances or re-settle the market.

use chrono::Utc;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::errors::{MarketError, MarketResult};
use crate::ledger::{Appeal, AppealStatus, LedgerDb};
use crate::models::Principal;

pub const MIN_REASON_CHARS: usize = 10;
pub const MIN_NOTES_CHARS: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct AppealQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Clone)]
pub struct AppealService {
    ledger: LedgerDb,
}

impl AppealService {
    pub fn new(ledger: LedgerDb) -> Self {
        Self { ledger }
    }

    pub async fn create_appeal(
        &self,
        principal: &Principal,
        market_id: Uuid,
        reason: &str,
    ) -> MarketResult<Appeal> {
        let reason = reason.trim();
        if reason.chars().count() < MIN_REASON_CHARS {
            return Err(MarketError::validation(
                "reason",
                format!("reason must be at least {} characters", MIN_REASON_CHARS),
            ));
        }

        let appeal = self
            .ledger
            .atomic(|tx| {
                let market = tx.require_market(market_id)?;
                if !market.state.is_settled() {
                    return Err(MarketError::BetNotResolved);
                }
                if !tx.has_position(market_id, principal.user_id)? {
                    return Err(MarketError::NotParticipant);
                }

                let appeal = Appeal {
                    id: Uuid::new_v4(),
                    market_id,
                    user_id: principal.user_id,
                    reason: reason.to_string(),
                    status: AppealStatus::Pending,
                    admin_notes: None,
                    created_at: Utc::now(),
                    resolved_at: None,
                    resolved_by: None,
                };
                tx.insert_appeal(&appeal)?;
                Ok(appeal)
            })
            .await?;

        info!(appeal_id = %appeal.id, market_id = %market_id, user_id = %principal.user_id, "appeal filed");
        Ok(appeal)
    }

    /// Admins see every appeal; everyone else sees their own.
    pub async fn list_appeals(
        &self,
        principal: &Principal,
        query: &AppealQuery,
    ) -> MarketResult<Vec<Appeal>> {
        let status = match query.status.as_deref() {
            None | Some("") | Some("all") => None,
            Some(s) => Some(
                AppealStatus::from_str(s)
                    .ok_or_else(|| MarketError::validation("status", "unknown appeal status"))?,
            ),
        };
        let limit = query.limit.unwrap_or(20).clamp(1, MAX_PAGE_SIZE);
        let offset = query.offset.unwrap_or(0);
        let owner = if principal.is_admin() {
            None
        } else {
            Some(principal.user_id)
        };

        self.ledger
            .atomic(|tx| tx.list_appeals(owner, status, limit, offset))
            .await
    }

    /// One appeal, visible to the user who filed it and to admins.
    pub async fn get_appeal(&self, principal: &Principal, appeal_id: Uuid) -> MarketResult<Appeal> {
        let appeal = self
            .ledger
            .atomic(|tx| tx.get_appeal(appeal_id))
            .await?
            .ok_or(MarketError::AppealNotFound)?;
        if appeal.user_id != principal.user_id && !principal.is_admin() {
            return Err(MarketError::AppealForbidden);
        }
        Ok(appeal)
    }

    pub async fn resolve_appeal(
        &self,
        admin: &Principal,
        appeal_id: Uuid,
        status: AppealStatus,
        admin_notes: &str,
    ) -> MarketResult<Appeal> {
        if !admin.is_admin() {
            return Err(MarketError::AdminRequired);
        }
        if !matches!(status, AppealStatus::Approved | AppealStatus::Rejected) {
            return Err(MarketError::validation(
                "status",
                "status must be approved or rejected",
            ));
        }
        let notes = admin_notes.trim();
        if notes.chars().count() < MIN_NOTES_CHARS {
            return Err(MarketError::validation(
                "admin_notes",
                format!("admin notes must be at least {} characters", MIN_NOTES_CHARS),
            ));
        }

        let appeal = self
            .ledger
            .atomic(|tx| {
                let appeal = tx.get_appeal(appeal_id)?.ok_or(MarketError::AppealNotFound)?;
                if !appeal.status.is_open() {
                    return Err(MarketError::AppealAlreadyResolved);
                }
                if !tx.close_appeal(appeal_id, status, notes, admin.user_id, Utc::now())? {
                    return Err(MarketError::AppealAlreadyResolved);
                }
                tx.get_appeal(appeal_id)?.ok_or(MarketError::AppealNotFound)
            })
            .await?;

        info!(
            appeal_id = %appeal_id,
            status = status.as_str(),
            admin = %admin.user_id,
            "appeal resolved"
        );
        Ok(appeal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::models::{ArbitratorType, CreditTransaction, Side, TransactionKind, UserRole};
    use crate::settlement::{NewMarket, SettlementEngine};
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_appeal_lifecycle() {
        let clock = ManualClock::new(Utc::now());
        let ledger = LedgerDb::open_in_memory().unwrap();
        let engine = SettlementEngine::new(ledger.clone(), Arc::new(clock.clone()));
        let appeals = AppealService::new(ledger.clone());

        let creator = Principal::user(Uuid::new_v4(), None);
        let staker = Principal::user(Uuid::new_v4(), None);
        let outsider = Principal::user(Uuid::new_v4(), None);
        let admin = Principal {
            user_id: Uuid::new_v4(),
            email: None,
            role: UserRole::Admin,
        };

        ledger
            .atomic(|tx| {
                tx.ensure_user(staker.user_id, None, UserRole::User)?;
                tx.update_user_balance(staker.user_id, 50.0)?;
                tx.insert_credit_transaction(&CreditTransaction::new(
                    staker.user_id,
                    50.0,
                    TransactionKind::Purchase,
                    "seed".into(),
                ))
            })
            .await
            .unwrap();

        let market = engine
            .create_market(
                &creator,
                NewMarket {
                    title: "Will the launch happen".into(),
                    description: None,
                    deadline: clock.now() + Duration::hours(2),
                    arbitrator_type: ArbitratorType::Creator,
                    arbitrator_email: None,
                    minimum_stake: 1.0,
                },
            )
            .await
            .unwrap();
        engine
            .place_stake(&staker, market.id, Side::Yes, 10.0)
            .await
            .unwrap();

        let reason = "The launch was scrubbed, outcome is wrong";
        let err = appeals
            .create_appeal(&staker, market.id, reason)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::BetNotResolved));

        clock.advance(Duration::hours(3));
        engine
            .resolve_market(&creator, market.id, Side::No, None)
            .await
            .unwrap();

        let err = appeals
            .create_appeal(&staker, market.id, "too short")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = appeals
            .create_appeal(&outsider, market.id, reason)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::NotParticipant));

        let appeal = appeals
            .create_appeal(&staker, market.id, reason)
            .await
            .unwrap();
        assert_eq!(appeal.status, AppealStatus::Pending);

        let err = appeals
            .create_appeal(&staker, market.id, reason)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::AppealExists));

        let query = AppealQuery {
            status: None,
            limit: None,
            offset: None,
        };
        assert_eq!(appeals.list_appeals(&staker, &query).await.unwrap().len(), 1);
        assert!(appeals.list_appeals(&outsider, &query).await.unwrap().is_empty());
        assert_eq!(appeals.list_appeals(&admin, &query).await.unwrap().len(), 1);

        assert_eq!(appeals.get_appeal(&staker, appeal.id).await.unwrap().reason, reason);
        assert_eq!(appeals.get_appeal(&admin, appeal.id).await.unwrap().id, appeal.id);
        let err = appeals.get_appeal(&outsider, appeal.id).await.unwrap_err();
        assert!(matches!(err, MarketError::AppealForbidden));
        let err = appeals.get_appeal(&staker, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, MarketError::AppealNotFound));

        let err = appeals
            .resolve_appeal(&staker, appeal.id, AppealStatus::Approved, "looks right to me")
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::AdminRequired));

        let resolved = appeals
            .resolve_appeal(&admin, appeal.id, AppealStatus::Rejected, "Outcome verified against news")
            .await
            .unwrap();
        assert_eq!(resolved.status, AppealStatus::Rejected);
        assert_eq!(resolved.resolved_by, Some(admin.user_id));

        let err = appeals
            .resolve_appeal(&admin, appeal.id, AppealStatus::Approved, "Changed my mind here")
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::AppealAlreadyResolved));

        let err = appeals
            .resolve_appeal(&admin, Uuid::new_v4(), AppealStatus::Approved, "No such appeal here")
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::AppealNotFound));
    }
}
