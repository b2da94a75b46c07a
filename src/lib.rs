//! Key quota service - API key verification with metered budgets.
//!
//! Each key may carry a replenishing rate limit, a finite request count, or
//! both. The verification engine decides per request whether the key is
//! within budget and debits it with a version-guarded write, so concurrent
//! verifiers in any number of processes never over-admit.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod store;
