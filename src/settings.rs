//! Runtime configuration
//!
//! Settings are loaded from an optional `escrow.toml` file with `ESCROW_*`
//! environment overrides. The process entry point loads them once, opens the
//! ledger store, and constructs the service; nothing here is read lazily at
//! call time.

use crate::error::EscrowError;
use crate::transfer::TransferConfig;
use crate::EscrowResult;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Service-level settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Address of the custody wallet holding escrowed funds
    pub custody_address: String,
    /// Network RPC endpoint
    pub rpc_url: String,
    /// Confirmation polls before a transfer wait times out
    pub max_confirmation_attempts: u32,
    /// Base confirmation poll delay in milliseconds
    pub poll_interval_ms: u64,
    /// Backoff cap in milliseconds
    pub max_poll_interval_ms: u64,
    /// Seconds a confirmed transfer stays replayable in the registry
    pub registry_retention_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let transfer = TransferConfig::default();
        Self {
            custody_address: String::new(),
            rpc_url: "https://api.devnet.solana.com".to_string(),
            max_confirmation_attempts: transfer.max_confirmation_attempts,
            poll_interval_ms: transfer.poll_interval.as_millis() as u64,
            max_poll_interval_ms: transfer.max_poll_interval.as_millis() as u64,
            registry_retention_secs: transfer.registry_retention.as_secs(),
        }
    }
}

impl Settings {
    /// Load settings from `escrow.toml` (if present) and `ESCROW_*`
    /// environment variables
    pub fn load() -> EscrowResult<Self> {
        let defaults = Settings::default();
        let cfg = Config::builder()
            .set_default("custody_address", defaults.custody_address.clone())
            .map_err(|e| EscrowError::config(e.to_string()))?
            .set_default("rpc_url", defaults.rpc_url.clone())
            .map_err(|e| EscrowError::config(e.to_string()))?
            .set_default(
                "max_confirmation_attempts",
                defaults.max_confirmation_attempts as i64,
            )
            .map_err(|e| EscrowError::config(e.to_string()))?
            .set_default("poll_interval_ms", defaults.poll_interval_ms as i64)
            .map_err(|e| EscrowError::config(e.to_string()))?
            .set_default("max_poll_interval_ms", defaults.max_poll_interval_ms as i64)
            .map_err(|e| EscrowError::config(e.to_string()))?
            .set_default(
                "registry_retention_secs",
                defaults.registry_retention_secs as i64,
            )
            .map_err(|e| EscrowError::config(e.to_string()))?
            .add_source(File::with_name("escrow").required(false))
            .add_source(Environment::with_prefix("ESCROW"))
            .build()
            .map_err(|e| EscrowError::config(e.to_string()))?;

        let settings: Settings = cfg
            .try_deserialize()
            .map_err(|e| EscrowError::config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Transfer orchestrator configuration derived from these settings
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            max_confirmation_attempts: self.max_confirmation_attempts,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_poll_interval: Duration::from_millis(self.max_poll_interval_ms),
            registry_retention: Duration::from_secs(self.registry_retention_secs),
        }
    }

    fn validate(&self) -> EscrowResult<()> {
        if self.custody_address.trim().is_empty() {
            return Err(EscrowError::config("custody_address is required"));
        }
        if self.max_confirmation_attempts == 0 {
            return Err(EscrowError::config(
                "max_confirmation_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}
