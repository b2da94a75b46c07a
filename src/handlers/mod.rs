//! HTTP request handlers (route handlers).
//!
//! Handlers only translate between JSON and the verification engine; every
//! budget decision is made in `services`.

/// Health check endpoint
pub mod health;
/// Key verification endpoint
pub mod keys;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::services::verification::VerificationEngine;
use crate::store::KeyStore;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<VerificationEngine>,
    pub store: Arc<dyn KeyStore>,
}

impl AppState {
    pub fn new(engine: Arc<VerificationEngine>, store: Arc<dyn KeyStore>) -> Self {
        Self { engine, store }
    }
}

/// Build the application router without transport layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/v1/keys/verify", post(keys::verify_key))
        .with_state(state)
}
