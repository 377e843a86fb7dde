//! HTTP surface
//!
//! Thin axum handlers over the settlement engine, credit and appeal services
//! and the AI arbiter.

mod error;
pub mod routes;

pub use error::ApiError;
pub use routes::{create_router, AppState};
