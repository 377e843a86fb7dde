//! Prophet Backend Library
//!
//! Ledger, settlement and AI arbitration for peer-to-peer prediction markets.
//! The `prophet` binary wires these into an HTTP service.

pub mod api;
pub mod appeals;
pub mod arbitration;
pub mod auth;
pub mod clock;
pub mod comments;
pub mod config;
pub mod credits;
pub mod errors;
pub mod ledger;
pub mod middleware;
pub mod models;
pub mod settlement;
