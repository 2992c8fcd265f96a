//! # suitegate_core
//!
//! Authentication core and pooled multi-server connection manager.
//!
//! - [`auth`]: JWT issuance and verification, refresh-token rotation,
//!   failed-login lockout, rate limiting and audit.
//! - [`pool`]: primary/replica connection pool with load balancing,
//!   health checks and failover.

pub mod auth;
pub mod clock;
pub mod config;
pub mod models;
pub mod pool;
pub mod random;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
