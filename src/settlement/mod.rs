//! Settlement: payout planning and the engine that applies it to the ledger.

mod engine;
mod plan;

pub use engine::{
    authorize_arbitrator, CancelOutcome, NewMarket, RefundFailure, ResolveOutcome,
    SettlementEngine, StakeReceipt,
};
pub use plan::{
    compute_settlement, conservation_tolerance, PlannedCredit, SettlementPlan, CONSERVATION_EPSILON,
};
