//! Data models for key records, decisions and the HTTP surface.

/// Key record and rate-limit policy model
pub mod key;
/// Authorization decisions
pub mod decision;
/// Verification request/response bodies
pub mod verify;
