//! Error taxonomy for ledger, settlement and arbitration operations.
//!
//! Every rejected precondition carries a stable machine-readable code so API
//! callers can branch on it without parsing messages.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

/// Broad class of a failure, used for HTTP mapping and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    StateConflict,
    Authorization,
    NotFound,
    Consistency,
    Storage,
}

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("market not found")]
    MarketNotFound,

    #[error("market is already resolved")]
    AlreadyResolved,

    #[error("cannot resolve market before deadline")]
    DeadlineNotPassed,

    #[error("market deadline has passed")]
    DeadlinePassed,

    #[error("you are not authorized to resolve this market")]
    UnauthorizedArbitrator,

    #[error("AI markets must be resolved through the AI arbitrator")]
    AiBetManualResolve,

    #[error("only the market creator can cancel this market")]
    NotCreator,

    #[error("cannot cancel a resolved market")]
    BetResolved,

    #[error("market is not accepting stakes")]
    MarketClosed,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("insufficient balance: {available:.2} < {required:.2}")]
    InsufficientBalance { available: f64, required: f64 },

    #[error("{field}: {message}")]
    Validation { field: String, message: String },

    #[error("payouts {payouts} do not sum to pool total {pool_total}")]
    ConservationViolation { payouts: f64, pool_total: f64 },

    #[error("position {position_id} already has a {kind} transaction")]
    DuplicateSettlement { position_id: String, kind: String },

    #[error("market has not been resolved yet")]
    BetNotResolved,

    #[error("you can only appeal markets you participated in")]
    NotParticipant,

    #[error("you have already submitted an appeal for this market")]
    AppealExists,

    #[error("appeal not found")]
    AppealNotFound,

    #[error("appeal has already been resolved")]
    AppealAlreadyResolved,

    #[error("you do not have permission to view this appeal")]
    AppealForbidden,

    #[error("comment not found")]
    CommentNotFound,

    #[error("comment is already deleted")]
    CommentDeleted,

    #[error("you can only delete your own comments")]
    NotCommentOwner,

    #[error("admin role required")]
    AdminRequired,

    #[error("user not found")]
    UserNotFound,

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl MarketError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        MarketError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            MarketError::MarketNotFound => "MARKET_NOT_FOUND",
            MarketError::AlreadyResolved => "ALREADY_RESOLVED",
            MarketError::DeadlineNotPassed => "DEADLINE_NOT_PASSED",
            MarketError::DeadlinePassed => "DEADLINE_PASSED",
            MarketError::UnauthorizedArbitrator => "UNAUTHORIZED_ARBITRATOR",
            MarketError::AiBetManualResolve => "AI_BET_MANUAL_RESOLVE",
            MarketError::NotCreator => "NOT_CREATOR",
            MarketError::BetResolved => "BET_RESOLVED",
            MarketError::MarketClosed => "MARKET_CLOSED",
            MarketError::InvalidAmount(_) => "INVALID_AMOUNT",
            MarketError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            MarketError::Validation { .. } => "VALIDATION_ERROR",
            MarketError::ConservationViolation { .. } => "CONSERVATION_VIOLATION",
            MarketError::DuplicateSettlement { .. } => "DUPLICATE_SETTLEMENT",
            MarketError::BetNotResolved => "BET_NOT_RESOLVED",
            MarketError::NotParticipant => "NOT_PARTICIPANT",
            MarketError::AppealExists => "APPEAL_EXISTS",
            MarketError::AppealNotFound => "APPEAL_NOT_FOUND",
            MarketError::AppealAlreadyResolved => "APPEAL_ALREADY_RESOLVED",
            MarketError::AppealForbidden => "APPEAL_FORBIDDEN",
            MarketError::CommentNotFound => "COMMENT_NOT_FOUND",
            MarketError::CommentDeleted => "ALREADY_DELETED",
            MarketError::NotCommentOwner => "NOT_OWNER",
            MarketError::AdminRequired => "ADMIN_REQUIRED",
            MarketError::UserNotFound => "USER_NOT_FOUND",
            MarketError::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MarketError::InvalidAmount(_) | MarketError::Validation { .. } => ErrorKind::Validation,
            MarketError::AlreadyResolved
            | MarketError::DeadlineNotPassed
            | MarketError::DeadlinePassed
            | MarketError::BetResolved
            | MarketError::MarketClosed
            | MarketError::InsufficientBalance { .. }
            | MarketError::DuplicateSettlement { .. }
            | MarketError::BetNotResolved
            | MarketError::AppealExists
            | MarketError::AppealAlreadyResolved
            | MarketError::CommentDeleted => ErrorKind::StateConflict,
            MarketError::UnauthorizedArbitrator
            | MarketError::AiBetManualResolve
            | MarketError::NotCreator
            | MarketError::NotParticipant
            | MarketError::AppealForbidden
            | MarketError::NotCommentOwner
            | MarketError::AdminRequired => ErrorKind::Authorization,
            MarketError::MarketNotFound
            | MarketError::AppealNotFound
            | MarketError::CommentNotFound
            | MarketError::UserNotFound => ErrorKind::NotFound,
            MarketError::ConservationViolation { .. } => ErrorKind::Consistency,
            MarketError::Storage(_) => ErrorKind::Storage,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            // Losing a resolution race is a conflict, not a bad request
            MarketError::AlreadyResolved => StatusCode::CONFLICT,
            _ => match self.kind() {
                ErrorKind::Validation | ErrorKind::StateConflict => StatusCode::BAD_REQUEST,
                ErrorKind::Authorization => StatusCode::FORBIDDEN,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Consistency | ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl From<rusqlite::Error> for MarketError {
    fn from(err: rusqlite::Error) -> Self {
        MarketError::Storage(err.into())
    }
}

pub type MarketResult<T> = std::result::Result<T, MarketError>;

/// Failures of the AI arbitration path.
///
/// `Unresolvable` is an evidentiary conclusion; `Service` and `Timeout` mean
/// the AI stack did not produce an answer and the caller may retry.
#[derive(Error, Debug)]
pub enum ArbitrationError {
    #[error("market is already resolved")]
    BetResolved,

    #[error("this market is not set up for AI arbitration")]
    NotAiBet,

    #[error("cannot resolve market before deadline")]
    DeadlineNotPassed,

    #[error("security violation: suspicious content detected in market")]
    SecurityViolation,

    #[error("market cannot be resolved: {conclusion}")]
    Unresolvable {
        conclusion: String,
        reasoning: String,
        search_count: usize,
    },

    #[error("AI arbitration timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("AI arbitration service error: {0:#}")]
    Service(anyhow::Error),

    #[error("AI arbitration is not configured")]
    NotConfigured,
}

impl ArbitrationError {
    pub fn code(&self) -> &'static str {
        match self {
            ArbitrationError::BetResolved => "BET_RESOLVED",
            ArbitrationError::NotAiBet => "NOT_AI_BET",
            ArbitrationError::DeadlineNotPassed => "DEADLINE_NOT_PASSED",
            ArbitrationError::SecurityViolation => "SECURITY_VIOLATION",
            ArbitrationError::Unresolvable { .. } => "UNRESOLVABLE",
            ArbitrationError::Timeout(_) => "AI_TIMEOUT",
            ArbitrationError::Service(_) => "AI_ERROR",
            ArbitrationError::NotConfigured => "AI_NOT_CONFIGURED",
        }
    }

    /// Technical failures a caller may retry. Never true for `Unresolvable`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ArbitrationError::Timeout(_) | ArbitrationError::Service(_)
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ArbitrationError::BetResolved
            | ArbitrationError::NotAiBet
            | ArbitrationError::DeadlineNotPassed
            | ArbitrationError::SecurityViolation => StatusCode::BAD_REQUEST,
            ArbitrationError::Unresolvable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ArbitrationError::Timeout(_)
            | ArbitrationError::Service(_)
            | ArbitrationError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ArbitrationError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ArbitrationError::Service(err) => {
                tracing::error!("AI arbitration error: {:#}", err);
                json!({
                    "error": "AI arbitration system temporarily unavailable",
                    "code": self.code(),
                    "retryable": true,
                })
            }
            ArbitrationError::Unresolvable {
                reasoning,
                search_count,
                ..
            } => json!({
                "error": self.to_string(),
                "code": self.code(),
                "reasoning": reasoning,
                "search_count": search_count,
                "retryable": false,
            }),
            other => json!({
                "error": other.to_string(),
                "code": other.code(),
                "retryable": other.is_retryable(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

impl IntoResponse for MarketError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            MarketError::Storage(err) => {
                tracing::error!("Ledger storage error: {:#}", err);
                "Internal server error".to_string()
            }
            MarketError::ConservationViolation { .. } => {
                tracing::error!("{}", self);
                "Settlement aborted: ledger consistency check failed".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}
