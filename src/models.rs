//! Domain Models
//! Markets, stakes, ledger records and the principals that act on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hard ceiling for a single stake and for a market's minimum stake.
pub const MAX_STAKE: f64 = 1_000_000.0;
/// Lower bound for a market's minimum stake.
pub const MIN_STAKE_FLOOR: f64 = 1.0;

/// Who is allowed to declare the outcome of a market.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArbitratorType {
    Creator,
    Friend,
    Ai,
}

impl ArbitratorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArbitratorType::Creator => "creator",
            ArbitratorType::Friend => "friend",
            ArbitratorType::Ai => "ai",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "creator" => Some(ArbitratorType::Creator),
            "friend" => Some(ArbitratorType::Friend),
            "ai" => Some(ArbitratorType::Ai),
            _ => None,
        }
    }
}

/// One side of a binary market. Also used as the resolved outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "yes" => Some(Side::Yes),
            "no" => Some(Side::No),
            _ => None,
        }
    }

    pub fn from_bool(outcome: bool) -> Self {
        if outcome {
            Side::Yes
        } else {
            Side::No
        }
    }
}

/// Lifecycle of a market. The outcome only exists once the market is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketState {
    Active,
    Cancelled,
    Resolved(Side),
}

impl MarketState {
    pub fn status_str(&self) -> &'static str {
        match self {
            MarketState::Active => "active",
            MarketState::Cancelled => "cancelled",
            MarketState::Resolved(_) => "resolved",
        }
    }

    pub fn outcome(&self) -> Option<Side> {
        match self {
            MarketState::Resolved(side) => Some(*side),
            _ => None,
        }
    }

    /// Settled in either direction: paid out or refunded.
    pub fn is_settled(&self) -> bool {
        !matches!(self, MarketState::Active)
    }

    /// Decode the stored `status`/`outcome` column pair, rejecting combinations
    /// that cannot describe a real market.
    pub fn from_columns(status: &str, outcome: Option<&str>) -> Option<Self> {
        match (status, outcome) {
            ("active", None) => Some(MarketState::Active),
            ("cancelled", None) => Some(MarketState::Cancelled),
            ("resolved", Some(o)) => Side::from_str(o).map(MarketState::Resolved),
            _ => None,
        }
    }
}

/// A yes/no proposition users stake credits on.
#[derive(Debug, Clone)]
pub struct Market {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub deadline: DateTime<Utc>,
    pub arbitrator_type: ArbitratorType,
    pub arbitrator_email: Option<String>,
    pub minimum_stake: f64,
    pub creator_id: Uuid,
    pub state: MarketState,
    pub pool_for: f64,
    pub pool_against: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Market {
    pub fn pool_total(&self) -> f64 {
        self.pool_for + self.pool_against
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.deadline <= now
    }

    pub fn view(&self) -> MarketView {
        MarketView {
            id: self.id,
            title: self.title.clone(),
            description: self.description.clone(),
            deadline: self.deadline,
            arbitrator_type: self.arbitrator_type,
            arbitrator_email: self.arbitrator_email.clone(),
            minimum_stake: self.minimum_stake,
            creator_id: self.creator_id,
            status: self.state.status_str().to_string(),
            resolved: self.state.is_settled(),
            outcome: self.state.outcome(),
            pool_for: self.pool_for,
            pool_against: self.pool_against,
            pool_total: self.pool_total(),
            created_at: self.created_at,
        }
    }
}

/// Flat market shape returned to API clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketView {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub deadline: DateTime<Utc>,
    pub arbitrator_type: ArbitratorType,
    pub arbitrator_email: Option<String>,
    pub minimum_stake: f64,
    pub creator_id: Uuid,
    pub status: String,
    pub resolved: bool,
    pub outcome: Option<Side>,
    pub pool_for: f64,
    pub pool_against: f64,
    pub pool_total: f64,
    pub created_at: DateTime<Utc>,
}

/// A user's stake on one side of a market. Never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub market_id: Uuid,
    pub user_id: Uuid,
    pub side: Side,
    pub amount: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Purchase,
    Bet,
    Payout,
    Refund,
    AdminAdjustment,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Purchase => "purchase",
            TransactionKind::Bet => "bet",
            TransactionKind::Payout => "payout",
            TransactionKind::Refund => "refund",
            TransactionKind::AdminAdjustment => "admin_adjustment",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "purchase" => Some(TransactionKind::Purchase),
            "bet" => Some(TransactionKind::Bet),
            "payout" => Some(TransactionKind::Payout),
            "refund" => Some(TransactionKind::Refund),
            "admin_adjustment" => Some(TransactionKind::AdminAdjustment),
            _ => None,
        }
    }
}

/// Append-only audit record of a balance delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Signed: negative for debits.
    pub amount: f64,
    pub kind: TransactionKind,
    pub description: String,
    pub market_id: Option<Uuid>,
    pub position_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    pub fn new(user_id: Uuid, amount: f64, kind: TransactionKind, description: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            amount,
            kind,
            description,
            market_id: None,
            position_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_position(mut self, position: &Position) -> Self {
        self.market_id = Some(position.market_id);
        self.position_id = Some(position.id);
        self
    }
}

/// Written exactly once per settled market; its existence blocks re-resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionDecision {
    pub id: Uuid,
    pub market_id: Uuid,
    pub outcome: Side,
    pub arbitrator_id: Uuid,
    pub reasoning: Option<String>,
    pub total_payout: f64,
    pub winners_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UserRole {
    #[serde(rename = "admin")]
    Admin,
    #[serde(rename = "user")]
    User,
    #[serde(rename = "system")]
    System, // Internal callers: AI arbitrator, payment processor relay
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::User => "user",
            UserRole::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "admin" => Some(UserRole::Admin),
            "user" => Some(UserRole::User),
            "system" => Some(UserRole::System),
            _ => None,
        }
    }
}

/// The authenticated caller, as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Uuid,
    /// Verified email, when the provider has one.
    pub email: Option<String>,
    pub role: UserRole,
}

impl Principal {
    /// Fixed id of the AI arbitrator.
    pub const SYSTEM_AI_ID: Uuid = Uuid::nil();

    pub fn user(user_id: Uuid, email: Option<String>) -> Self {
        Self {
            user_id,
            email,
            role: UserRole::User,
        }
    }

    pub fn system_ai() -> Self {
        Self {
            user_id: Self::SYSTEM_AI_ID,
            email: None,
            role: UserRole::System,
        }
    }

    pub fn is_system_ai(&self) -> bool {
        self.user_id == Self::SYSTEM_AI_ID && self.role == UserRole::System
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.role, UserRole::Admin | UserRole::System)
    }
}
