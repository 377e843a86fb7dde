//! Settlement Engine
//!
//! The single funnel for every market mutation that moves credits: stake
//! placement, resolution payouts and cancellation refunds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::plan::{compute_settlement, SettlementPlan};
use crate::clock::Clock;
use crate::errors::{MarketError, MarketResult};
use crate::ledger::{LedgerDb, LedgerTx};
use crate::models::{
    ArbitratorType, CreditTransaction, Market, MarketState, Position, Principal,
    ResolutionDecision, Side, TransactionKind, MAX_STAKE, MIN_STAKE_FLOOR,
};

pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_DESCRIPTION_CHARS: usize = 1000;

/// Market creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMarket {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub deadline: DateTime<Utc>,
    pub arbitrator_type: ArbitratorType,
    #[serde(default)]
    pub arbitrator_email: Option<String>,
    pub minimum_stake: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StakeReceipt {
    pub stake_id: Uuid,
    pub new_balance: f64,
    pub pool_for: f64,
    pub pool_against: f64,
    pub pool_total: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveOutcome {
    pub decision_id: Uuid,
    pub market_id: Uuid,
    pub outcome: Side,
    pub total_payout: f64,
    pub winners_count: usize,
    /// Nobody backed the outcome; every stake was returned.
    pub refunded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundFailure {
    pub position_id: Uuid,
    pub user_id: Uuid,
    pub amount: f64,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub market_id: Uuid,
    pub refunded_count: usize,
    pub total_refunded: f64,
    pub failures: Vec<RefundFailure>,
}

#[derive(Clone)]
pub struct SettlementEngine {
    ledger: LedgerDb,
    clock: Arc<dyn Clock>,
}

impl SettlementEngine {
    pub fn new(ledger: LedgerDb, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock }
    }

    pub fn ledger(&self) -> &LedgerDb {
        &self.ledger
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn get_market(&self, market_id: Uuid) -> MarketResult<Market> {
        self.ledger.atomic(|tx| tx.require_market(market_id)).await
    }

    pub async fn list_positions(&self, market_id: Uuid) -> MarketResult<Vec<Position>> {
        self.ledger
            .atomic(|tx| {
                tx.require_market(market_id)?;
                tx.list_positions(market_id)
            })
            .await
    }

    pub async fn create_market(&self, creator: &Principal, req: NewMarket) -> MarketResult<Market> {
        let now = self.clock.now();
        let market = validate_new_market(creator, req, now)?;

        self.ledger
            .atomic(|tx| {
                tx.ensure_user(creator.user_id, creator.email.as_deref(), creator.role)?;
                tx.insert_market(&market)
            })
            .await?;

        info!(
            market_id = %market.id,
            creator = %creator.user_id,
            arbitrator = market.arbitrator_type.as_str(),
            deadline = %market.deadline,
            "market created"
        );
        Ok(market)
    }

    /// Debit the stake, record the position and grow the matching pool in one unit.
    pub async fn place_stake(
        &self,
        staker: &Principal,
        market_id: Uuid,
        side: Side,
        amount: f64,
    ) -> MarketResult<StakeReceipt> {
        let now = self.clock.now();

        let receipt = self
            .ledger
            .atomic(|tx| {
                let market = tx.require_market(market_id)?;
                if market.state != MarketState::Active {
                    return Err(MarketError::MarketClosed);
                }
                if market.deadline_passed(now) {
                    return Err(MarketError::DeadlinePassed);
                }
                if !(amount.is_finite() && amount > 0.0) {
                    return Err(MarketError::InvalidAmount("amount must be positive".into()));
                }
                if amount < market.minimum_stake {
                    return Err(MarketError::InvalidAmount(format!(
                        "minimum stake is {}",
                        market.minimum_stake
                    )));
                }
                if amount > MAX_STAKE {
                    return Err(MarketError::InvalidAmount(format!(
                        "maximum stake is {}",
                        MAX_STAKE
                    )));
                }

                tx.ensure_user(staker.user_id, staker.email.as_deref(), staker.role)?;
                let new_balance = tx.update_user_balance(staker.user_id, -amount)?;

                let position = Position {
                    id: Uuid::new_v4(),
                    market_id,
                    user_id: staker.user_id,
                    side,
                    amount,
                    created_at: now,
                };
                tx.insert_position(&position)?;
                tx.update_market_pools(market_id, side, amount)?;
                tx.insert_credit_transaction(
                    &CreditTransaction::new(
                        staker.user_id,
                        -amount,
                        TransactionKind::Bet,
                        format!("Stake {} on \"{}\"", side.as_str(), market.title),
                    )
                    .for_position(&position),
                )?;

                let market = tx.require_market(market_id)?;
                Ok(StakeReceipt {
                    stake_id: position.id,
                    new_balance,
                    pool_for: market.pool_for,
                    pool_against: market.pool_against,
                    pool_total: market.pool_total(),
                })
            })
            .await?;

        debug!(
            market_id = %market_id,
            user_id = %staker.user_id,
            side = side.as_str(),
            amount,
            pool_total = receipt.pool_total,
            "stake placed"
        );
        Ok(receipt)
    }

    /// Declare the outcome and distribute the pool. At most once per market.
    pub async fn resolve_market(
        &self,
        arbitrator: &Principal,
        market_id: Uuid,
        outcome: Side,
        reasoning: Option<String>,
    ) -> MarketResult<ResolveOutcome> {
        let now = self.clock.now();

        let (decision, plan) = self
            .ledger
            .atomic(|tx| {
                let market = tx.require_market(market_id)?;
                if market.state.is_settled() || tx.get_resolution_decision(market_id)?.is_some() {
                    return Err(MarketError::AlreadyResolved);
                }
                if !market.deadline_passed(now) {
                    return Err(MarketError::DeadlineNotPassed);
                }
                authorize_arbitrator(&market, arbitrator)?;

                let positions = tx.list_positions(market_id)?;
                let plan = compute_settlement(&positions, outcome)?;

                let decision = ResolutionDecision {
                    id: Uuid::new_v4(),
                    market_id,
                    outcome,
                    arbitrator_id: arbitrator.user_id,
                    reasoning: reasoning.clone(),
                    total_payout: plan.total_credited(),
                    winners_count: plan.winners_count as i64,
                    created_at: now,
                };
                tx.insert_resolution_decision(&decision)?;

                apply_plan(tx, &market, &plan)?;

                if !tx.update_market_state(market_id, MarketState::Resolved(outcome))? {
                    return Err(MarketError::AlreadyResolved);
                }
                Ok((decision, plan))
            })
            .await?;

        info!(
            market_id = %market_id,
            decision_id = %decision.id,
            outcome = outcome.as_str(),
            arbitrator = %arbitrator.user_id,
            total_payout = decision.total_payout,
            winners = plan.winners_count,
            refunded = plan.refund_all,
            "market resolved"
        );

        Ok(ResolveOutcome {
            decision_id: decision.id,
            market_id,
            outcome,
            total_payout: decision.total_payout,
            winners_count: plan.winners_count,
            refunded: plan.refund_all,
        })
    }

    /// Cancel before the deadline and hand every stake back.
    ///
    /// The state change commits first. Each refund then runs in its own unit so
    /// one failing staker does not block the rest; failures are returned and
    /// can be retried with [`SettlementEngine::retry_refunds`].
    pub async fn cancel_market(
        &self,
        requester: &Principal,
        market_id: Uuid,
    ) -> MarketResult<CancelOutcome> {
        let now = self.clock.now();

        let positions = self
            .ledger
            .atomic(|tx| {
                let market = tx.require_market(market_id)?;
                if market.creator_id != requester.user_id {
                    return Err(MarketError::NotCreator);
                }
                if market.state.is_settled() {
                    return Err(MarketError::BetResolved);
                }
                if market.deadline_passed(now) {
                    return Err(MarketError::DeadlinePassed);
                }
                if !tx.update_market_state(market_id, MarketState::Cancelled)? {
                    return Err(MarketError::BetResolved);
                }
                tx.list_positions(market_id)
            })
            .await?;

        info!(
            market_id = %market_id,
            requester = %requester.user_id,
            positions = positions.len(),
            "market cancelled, refunding stakes"
        );

        Ok(self.refund_positions(market_id, positions).await)
    }

    /// Refund cancelled-market positions that still have no refund record.
    pub async fn retry_refunds(
        &self,
        requester: &Principal,
        market_id: Uuid,
    ) -> MarketResult<CancelOutcome> {
        let pending = self
            .ledger
            .atomic(|tx| {
                let market = tx.require_market(market_id)?;
                if market.creator_id != requester.user_id && !requester.is_admin() {
                    return Err(MarketError::NotCreator);
                }
                if market.state != MarketState::Cancelled {
                    return Err(MarketError::validation("market", "market is not cancelled"));
                }
                let refunded: HashSet<Uuid> = tx
                    .settled_position_ids(market_id, TransactionKind::Refund)?
                    .into_iter()
                    .collect();
                Ok(tx
                    .list_positions(market_id)?
                    .into_iter()
                    .filter(|p| !refunded.contains(&p.id))
                    .collect::<Vec<_>>())
            })
            .await?;

        if pending.is_empty() {
            debug!(market_id = %market_id, "no refunds outstanding");
        }

        Ok(self.refund_positions(market_id, pending).await)
    }

    async fn refund_positions(&self, market_id: Uuid, positions: Vec<Position>) -> CancelOutcome {
        let mut refunded_count = 0;
        let mut total_refunded = 0.0;
        let mut failures = Vec::new();

        for position in positions {
            let result = self
                .ledger
                .atomic(|tx| {
                    tx.update_user_balance(position.user_id, position.amount)?;
                    tx.insert_credit_transaction(
                        &CreditTransaction::new(
                            position.user_id,
                            position.amount,
                            TransactionKind::Refund,
                            "Refund for cancelled market".to_string(),
                        )
                        .for_position(&position),
                    )
                })
                .await;

            match result {
                Ok(()) => {
                    refunded_count += 1;
                    total_refunded += position.amount;
                }
                Err(e) => {
                    warn!(
                        market_id = %market_id,
                        position_id = %position.id,
                        user_id = %position.user_id,
                        amount = position.amount,
                        error = %e,
                        "stake refund failed, needs reconciliation"
                    );
                    failures.push(RefundFailure {
                        position_id: position.id,
                        user_id: position.user_id,
                        amount: position.amount,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            market_id = %market_id,
            refunded = refunded_count,
            total_refunded,
            failed = failures.len(),
            "refund pass finished"
        );

        CancelOutcome {
            market_id,
            refunded_count,
            total_refunded,
            failures,
        }
    }
}

fn apply_plan(tx: &LedgerTx<'_>, market: &Market, plan: &SettlementPlan) -> MarketResult<()> {
    for credit in &plan.credits {
        tx.update_user_balance(credit.user_id, credit.amount)?;

        let description = match credit.kind {
            TransactionKind::Refund => format!("Refund: nobody backed the outcome of \"{}\"", market.title),
            _ => format!("Payout for \"{}\"", market.title),
        };
        let mut record = CreditTransaction::new(credit.user_id, credit.amount, credit.kind, description);
        record.market_id = Some(market.id);
        record.position_id = Some(credit.position_id);
        tx.insert_credit_transaction(&record)?;
    }
    Ok(())
}

/// Check that `principal` may declare the outcome of `market`.
pub fn authorize_arbitrator(market: &Market, principal: &Principal) -> MarketResult<()> {
    match market.arbitrator_type {
        ArbitratorType::Creator => {
            if principal.user_id == market.creator_id && !principal.is_system_ai() {
                Ok(())
            } else {
                Err(MarketError::UnauthorizedArbitrator)
            }
        }
        ArbitratorType::Friend => {
            let matches = match (&principal.email, &market.arbitrator_email) {
                (Some(caller), Some(expected)) => {
                    caller.trim().eq_ignore_ascii_case(expected.trim())
                }
                _ => false,
            };
            if matches {
                Ok(())
            } else {
                Err(MarketError::UnauthorizedArbitrator)
            }
        }
        ArbitratorType::Ai => {
            if principal.is_system_ai() {
                Ok(())
            } else {
                Err(MarketError::AiBetManualResolve)
            }
        }
    }
}

fn validate_new_market(
    creator: &Principal,
    req: NewMarket,
    now: DateTime<Utc>,
) -> MarketResult<Market> {
    let title = req.title.trim().to_string();
    if title.is_empty() {
        return Err(MarketError::validation("title", "title is required"));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(MarketError::validation(
            "title",
            format!("title must be at most {} characters", MAX_TITLE_CHARS),
        ));
    }

    let description = req
        .description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());
    if let Some(d) = &description {
        if d.chars().count() > MAX_DESCRIPTION_CHARS {
            return Err(MarketError::validation(
                "description",
                format!("description must be at most {} characters", MAX_DESCRIPTION_CHARS),
            ));
        }
    }

    if req.deadline <= now {
        return Err(MarketError::validation("deadline", "deadline must be in the future"));
    }

    let arbitrator_email = match req.arbitrator_type {
        ArbitratorType::Friend => {
            let email = req
                .arbitrator_email
                .map(|e| e.trim().to_lowercase())
                .filter(|e| is_valid_email(e))
                .ok_or_else(|| {
                    MarketError::validation(
                        "arbitrator_email",
                        "a valid arbitrator email is required for friend arbitration",
                    )
                })?;
            Some(email)
        }
        ArbitratorType::Creator | ArbitratorType::Ai => None,
    };

    let minimum_stake = req.minimum_stake;
    if !(minimum_stake.is_finite() && (MIN_STAKE_FLOOR..=MAX_STAKE).contains(&minimum_stake)) {
        return Err(MarketError::validation(
            "minimum_stake",
            format!("minimum stake must be between {} and {}", MIN_STAKE_FLOOR, MAX_STAKE),
        ));
    }

    Ok(Market {
        id: Uuid::new_v4(),
        title,
        description,
        deadline: req.deadline,
        arbitrator_type: req.arbitrator_type,
        arbitrator_email,
        minimum_stake,
        creator_id: creator.user_id,
        state: MarketState::Active,
        pool_for: 0.0,
        pool_against: 0.0,
        created_at: now,
        updated_at: now,
    })
}

fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !email.contains(char::is_whitespace)
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains('@')
}
