//! Authentication Module
//! Bearer-token identity for API callers

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtHandler};
pub use middleware::{auth_middleware, AuthError};
