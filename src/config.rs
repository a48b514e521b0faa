use serde::{Deserialize, Serialize};
use std::env;

use crate::txn::IsolationLevel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub txn: TxnConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnConfig {
    /// Isolation level requested for new transactions. Forwarded to the
    /// engine; the engine remains the arbiter of lock contention.
    pub isolation: IsolationLevel,
    /// Unmanaged transactions that are neither committed nor rolled back
    /// within this window fail with `TxnExpired` on next use.
    pub unmanaged_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
                max_connections: 5,
                acquire_timeout_secs: 8,
            },
            txn: TxnConfig {
                isolation: IsolationLevel::Serializable,
                unmanaged_timeout_ms: 30_000,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite:data/entwine.db".to_string()),
                max_connections: env::var("DB_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
                acquire_timeout_secs: env::var("DB_ACQUIRE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "8".to_string())
                    .parse()
                    .unwrap_or(8),
            },
            txn: TxnConfig {
                isolation: env::var("TXN_ISOLATION")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(IsolationLevel::Serializable),
                unmanaged_timeout_ms: env::var("TXN_TIMEOUT_MS")
                    .unwrap_or_else(|_| "30000".to_string())
                    .parse()
                    .unwrap_or(30_000),
            },
        })
    }
}
