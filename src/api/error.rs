use axum::response::{IntoResponse, Response};

use crate::errors::{ArbitrationError, MarketError};

/// Every failure a handler can return.
#[derive(Debug)]
pub enum ApiError {
    Market(MarketError),
    Arbitration(ArbitrationError),
}

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        ApiError::Market(err)
    }
}

impl From<ArbitrationError> for ApiError {
    fn from(err: ArbitrationError) -> Self {
        ApiError::Arbitration(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Market(err) => err.into_response(),
            ApiError::Arbitration(err) => err.into_response(),
        }
    }
}
