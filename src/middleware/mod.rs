//! HTTP middleware shared by every route.

pub mod logging;

pub use logging::{request_logging, REQUEST_ID_HEADER};
