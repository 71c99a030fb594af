//! Configuration parsing for the tally system.
//!
//! Settings are read from an optional JSON file. Every field is optional;
//! missing values fall back to the compiled-in defaults below, which match
//! the production endpoint.
//!
//! # Example config
//!
//! ```json
//! {
//!   "Tally": { "module_name": "tally", "log_path": "/tmp/log" },
//!   "endpoint": { "host": "88.212.241.115", "port": 2012 },
//!   "tickets": 2018,
//!   "max_concurrency": 100,
//!   "connect_timeout_ms": 500,
//!   "send_timeout_ms": 500,
//!   "recv_timeout_ms": 500,
//!   "read_buffer_size": 8192
//! }
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::TallyError;

pub const DEFAULT_HOST: &str = "88.212.241.115";
pub const DEFAULT_PORT: u16 = 2012;
pub const DEFAULT_TICKETS: u32 = 2018;
pub const DEFAULT_MAX_CONCURRENCY: usize = 100;
pub const DEFAULT_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Module metadata (name, log path).
    #[serde(rename = "Tally")]
    pub tally: Option<ModuleMeta>,

    /// Remote endpoint.
    pub endpoint: Option<EndpointConfig>,

    /// Number of tickets to query (ids `1..=tickets`).
    pub tickets: Option<u32>,

    /// Upper bound on concurrently running exchanges.
    pub max_concurrency: Option<usize>,

    pub connect_timeout_ms: Option<u64>,
    pub send_timeout_ms: Option<u64>,
    pub recv_timeout_ms: Option<u64>,

    /// Size of the per-read receive buffer in bytes.
    pub read_buffer_size: Option<usize>,
}

/// Module metadata block.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
}

/// Remote host and port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl std::fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl AppConfig {
    pub fn effective_endpoint(&self) -> EndpointConfig {
        self.endpoint.clone().unwrap_or_default()
    }

    pub fn effective_tickets(&self) -> u32 {
        self.tickets.unwrap_or(DEFAULT_TICKETS)
    }

    pub fn effective_max_concurrency(&self) -> usize {
        self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    pub fn effective_read_buffer_size(&self) -> usize {
        self.read_buffer_size.unwrap_or(DEFAULT_READ_BUFFER_SIZE)
    }

    /// Returns the module name, defaulting to `"tally"`.
    pub fn module_name(&self) -> String {
        self.tally
            .as_ref()
            .and_then(|m| m.module_name.clone())
            .unwrap_or_else(|| "tally".to_string())
    }

    /// Returns the log path.
    pub fn log_path(&self) -> Option<String> {
        self.tally.as_ref().and_then(|m| m.log_path.clone())
    }

    /// Reject values the scheduler or exchange cannot run with.
    pub fn validate(&self) -> Result<(), TallyError> {
        if self.effective_max_concurrency() == 0 {
            return Err(TallyError::Config("max_concurrency must be at least 1".into()));
        }
        if self.effective_read_buffer_size() == 0 {
            return Err(TallyError::Config("read_buffer_size must be at least 1".into()));
        }
        if self.effective_endpoint().host.is_empty() {
            return Err(TallyError::Config("endpoint host must not be empty".into()));
        }
        Ok(())
    }
}

/// Load and parse a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
