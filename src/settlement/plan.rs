//! Pure payout computation.

use serde::Serialize;
use uuid::Uuid;

use crate::errors::{MarketError, MarketResult};
use crate::models::{Position, Side, TransactionKind};

/// Payouts may miss the pool by this many credits on small pools.
pub const CONSERVATION_EPSILON: f64 = 1e-6;

/// Allowed gap per credit in the pool once the pool is large enough that
/// float summation error exceeds the absolute floor.
pub const CONSERVATION_RELATIVE_EPSILON: f64 = 1e-12;

/// Largest acceptable gap between payouts and the pool for a pool of this size.
pub fn conservation_tolerance(total_pool: f64) -> f64 {
    CONSERVATION_EPSILON.max(total_pool.abs() * CONSERVATION_RELATIVE_EPSILON)
}

/// One balance credit the engine will apply for a position.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedCredit {
    pub position_id: Uuid,
    pub user_id: Uuid,
    pub amount: f64,
    pub kind: TransactionKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementPlan {
    pub outcome: Side,
    pub total_pool: f64,
    pub winning_pool: f64,
    pub winners_count: usize,
    /// True when nobody backed the outcome and every stake goes back to its owner.
    pub refund_all: bool,
    pub credits: Vec<PlannedCredit>,
}

impl SettlementPlan {
    pub fn total_credited(&self) -> f64 {
        self.credits.iter().map(|c| c.amount).sum()
    }
}

/// Split the whole pool across the winning side in proportion to each stake.
///
/// `payout = stake * total_pool / winning_pool`. The last winner receives
/// whatever the others leave of the pool, so rounding never strands credits.
/// When the winning side holds nothing the plan refunds every stake instead.
pub fn compute_settlement(positions: &[Position], outcome: Side) -> MarketResult<SettlementPlan> {
    let total_pool: f64 = positions.iter().map(|p| p.amount).sum();
    let winning_pool: f64 = positions
        .iter()
        .filter(|p| p.side == outcome)
        .map(|p| p.amount)
        .sum();

    let refund_all = winning_pool <= 0.0;

    let credits: Vec<PlannedCredit> = if refund_all {
        positions
            .iter()
            .map(|p| PlannedCredit {
                position_id: p.id,
                user_id: p.user_id,
                amount: p.amount,
                kind: TransactionKind::Refund,
            })
            .collect()
    } else {
        let multiplier = total_pool / winning_pool;
        let winners: Vec<&Position> = positions.iter().filter(|p| p.side == outcome).collect();
        let mut paid = 0.0;
        winners
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let amount = if i + 1 == winners.len() {
                    total_pool - paid
                } else {
                    p.amount * multiplier
                };
                paid += amount;
                PlannedCredit {
                    position_id: p.id,
                    user_id: p.user_id,
                    amount,
                    kind: TransactionKind::Payout,
                }
            })
            .collect()
    };

    let winners_count = if refund_all { 0 } else { credits.len() };

    let plan = SettlementPlan {
        outcome,
        total_pool,
        winning_pool,
        winners_count,
        refund_all,
        credits,
    };

    let payouts = plan.total_credited();
    let negative = plan.credits.iter().any(|c| c.amount < 0.0);
    if !payouts.is_finite()
        || negative
        || (payouts - total_pool).abs() > conservation_tolerance(total_pool)
    {
        return Err(MarketError::ConservationViolation {
            payouts,
            pool_total: total_pool,
        });
    }

    Ok(plan)
}
