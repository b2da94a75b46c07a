//! Application configuration management.
//!
//! Configuration is read from environment variables with the `envy` crate,
//! after an optional `.env` file has been loaded.

use std::time::Duration;

use serde::Deserialize;

use crate::services::verification::EngineConfig;

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `DATABASE_URL` (required): PostgreSQL connection string
/// - `SERVER_PORT` (optional): HTTP server port, defaults to 3000
/// - `DATABASE_MAX_CONNECTIONS` (optional): pool size, defaults to 5
/// - `LEDGER_TTL_MS` (optional): how long a cached key may be used to decide
///   before it is re-read, defaults to 1000. `0` disables the cache.
/// - `LEDGER_MAX_ENTRIES` (optional): cached keys per process, defaults to 100000
/// - `STORE_TIMEOUT_MS` (optional): deadline for each store call, defaults to 500
/// - `MAX_DEBIT_ATTEMPTS` (optional): conditional-write attempts per
///   verification, defaults to 3
///
/// # Staleness Bound
///
/// Debits are always version-guarded at the store, so neither budget can be
/// overdrawn. A cached copy can however miss an administrative change
/// (revocation through `expires`, a lowered policy) for up to
/// `LEDGER_TTL_MS`. The worst case over-admission after such a change is
/// `LEDGER_TTL_MS` times the verification throughput of a single process.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,

    #[serde(default = "default_port")]
    pub server_port: u16,

    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    #[serde(default = "default_ledger_ttl_ms")]
    pub ledger_ttl_ms: u64,

    #[serde(default = "default_ledger_max_entries")]
    pub ledger_max_entries: usize,

    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    #[serde(default = "default_max_debit_attempts")]
    pub max_debit_attempts: u32,
}

fn default_port() -> u16 {
    3000
}

fn default_max_connections() -> u32 {
    5
}

fn default_ledger_ttl_ms() -> u64 {
    1_000
}

fn default_ledger_max_entries() -> usize {
    100_000
}

fn default_store_timeout_ms() -> u64 {
    500
}

fn default_max_debit_attempts() -> u32 {
    3
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `DATABASE_URL` is missing or a value cannot be
    /// parsed into its expected type.
    pub fn from_env() -> Result<Self, envy::Error> {
        // Try to load .env file if it exists (does nothing if not found)
        dotenvy::dotenv().ok();

        envy::from_env::<Config>()
    }

    /// Engine tuning derived from this configuration.
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            max_attempts: self.max_debit_attempts.max(1),
            ledger_ttl: Duration::from_millis(self.ledger_ttl_ms),
            ledger_max_entries: self.ledger_max_entries,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_variables() {
        let vars = vec![(
            "DATABASE_URL".to_string(),
            "postgres://localhost/keys".to_string(),
        )];
        let config: Config = envy::from_iter(vars).unwrap();

        assert_eq!(config.server_port, 3000);
        assert_eq!(config.ledger_ttl_ms, 1_000);
        assert_eq!(config.max_debit_attempts, 3);

        let engine = config.engine();
        assert_eq!(engine.store_timeout, Duration::from_millis(500));
        assert_eq!(engine.ledger_max_entries, 100_000);
    }

    #[test]
    fn attempts_never_drop_to_zero() {
        let vars = vec![
            (
                "DATABASE_URL".to_string(),
                "postgres://localhost/keys".to_string(),
            ),
            ("MAX_DEBIT_ATTEMPTS".to_string(), "0".to_string()),
            ("LEDGER_TTL_MS".to_string(), "0".to_string()),
        ];
        let config: Config = envy::from_iter(vars).unwrap();

        assert_eq!(config.engine().max_attempts, 1);
        assert_eq!(config.engine().ledger_ttl, Duration::ZERO);
    }

    #[test]
    fn database_url_is_required() {
        let vars: Vec<(String, String)> = Vec::new();
        assert!(envy::from_iter::<_, Config>(vars).is_err());
    }
}
