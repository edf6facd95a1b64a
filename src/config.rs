//! Process configuration, read once at start-up
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MarketError, MarketResult};

pub const DB_PATH_VAR: &str = "AGRI_DB_PATH";
pub const LEDGER_TIMEOUT_VAR: &str = "AGRI_LEDGER_TIMEOUT_MS";
pub const MIRRORING_VAR: &str = "AGRI_LEDGER_MIRRORING";
pub const GATEWAY_VAR: &str = "AGRI_STORAGE_GATEWAY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketConfig {
    pub db_path: PathBuf,
    /// Upper bound on every ledger mirror call.
    pub ledger_timeout: Duration,
    pub mirroring_enabled: bool,
    pub storage_gateway: String,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("agri-trace.db"),
            ledger_timeout: Duration::from_millis(5_000),
            mirroring_enabled: true,
            storage_gateway: "gateway.pinata.cloud".to_string(),
        }
    }
}

impl MarketConfig {
    /// Load from the environment, after pulling in a `.env` file if present.
    pub fn from_env() -> MarketResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys keep their defaults.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> MarketResult<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup(DB_PATH_VAR) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup(LEDGER_TIMEOUT_VAR) {
            let millis: u64 = raw.trim().parse().map_err(|_| {
                MarketError::Validation(format!("{LEDGER_TIMEOUT_VAR} must be milliseconds, got '{raw}'"))
            })?;
            if millis == 0 {
                return Err(MarketError::Validation(format!("{LEDGER_TIMEOUT_VAR} must be above zero")));
            }
            config.ledger_timeout = Duration::from_millis(millis);
        }
        if let Some(raw) = lookup(MIRRORING_VAR) {
            config.mirroring_enabled = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(MarketError::Validation(format!(
                        "{MIRRORING_VAR} must be a boolean, got '{raw}'"
                    )));
                }
            };
        }
        if let Some(gateway) = lookup(GATEWAY_VAR) {
            config.storage_gateway = gateway;
        }

        Ok(config)
    }
}
