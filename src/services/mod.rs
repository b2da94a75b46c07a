//! Business logic services.
//!
//! Services hold the quota engine, separated from the HTTP handlers:
//! the pure rate window calculator, the caching quota ledger, and the
//! verification engine that ties them to the key store.

pub mod ledger;
pub mod rate_window;
pub mod verification;
