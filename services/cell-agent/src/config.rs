//! Configuration for the cell agent.

use anyhow::Result;
use uuid::Uuid;

/// Cell agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this cell.
    pub cell_id: String,

    /// Capability class this cell provides. Only workloads whose required
    /// stack matches are placed here.
    pub stack: String,

    /// Distributed store API URL.
    pub store_url: String,

    /// Execution backend API URL.
    pub executor_url: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Cell ID can be provided or auto-generated
        let cell_id = std::env::var("LOFT_CELL_ID")
            .unwrap_or_else(|_| format!("cell-{}", Uuid::new_v4().simple()));

        let stack = std::env::var("LOFT_STACK").unwrap_or_else(|_| "lucid64".to_string());

        let store_url = std::env::var("LOFT_STORE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8500".to_string());

        let executor_url = std::env::var("LOFT_EXECUTOR_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:1700".to_string());

        let log_level = std::env::var("LOFT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            cell_id,
            stack,
            store_url,
            executor_url,
            log_level,
        })
    }
}
