//! Configuration management for the Tradelink orchestrator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    pub validators: HashMap<String, ValidatorDescriptor>,
    #[serde(default)]
    pub business_logic: HashMap<String, BusinessLogicConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    pub instance_id: String,
    /// Upper bound for per-verifier correlation counters; wraps back to 1
    pub max_correlation_id: u64,
    pub sync_request_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

/// Connection information for one validator (external ledger adapter)
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorDescriptor {
    pub validator_id: String,
    pub validator_type: ValidatorType,
    pub endpoint_url: String,
    #[serde(default)]
    pub auth_key_path: String,
    #[serde(default)]
    pub supported_operations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorType {
    /// Persistent bidirectional channel with event monitoring
    Channel,
    /// Stateless request/response adapter, one POST per operation
    Request,
}

/// Per-trade-type configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BusinessLogicConfig {
    /// Ordered list of validator ids this trade type requires
    pub validator_ids: Vec<String>,
    #[serde(default)]
    pub asset_trade: Option<AssetTradeConfig>,
}

/// Parameters for the escrow/transfer/settlement asset trade
#[derive(Debug, Clone, Deserialize)]
pub struct AssetTradeConfig {
    pub ethereum_validator_id: String,
    pub fabric_validator_id: String,
    pub escrow_address: String,
    pub gas: u64,
    pub channel_name: String,
    pub chaincode_function: String,
    /// Hex-encoded signing keys by account address
    #[serde(default)]
    pub account_keys: HashMap<String, String>,
    /// Hex-encoded signing key for the escrow account (settlement phase)
    pub escrow_key: String,
    /// Hex-encoded ed25519 key used to sign chaincode proposals
    pub proposal_key: String,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("TRADELINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Parse settings from a TOML string (used by tests and embedded setups)
    pub fn from_toml(raw: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(&substitute_env_vars(raw))
            .with_context(|| "Failed to parse configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.validators.is_empty() {
            anyhow::bail!("At least one validator must be configured");
        }

        for (name, validator) in &self.validators {
            if validator.endpoint_url.is_empty() {
                anyhow::bail!("Validator {} has no endpoint URL configured", name);
            }
            if validator.validator_type == ValidatorType::Channel
                && validator.auth_key_path.is_empty()
            {
                anyhow::bail!(
                    "Validator {} is channel-based but has no auth key path",
                    name
                );
            }
        }

        for (blid, bl) in &self.business_logic {
            for vid in &bl.validator_ids {
                if !self.validators.contains_key(vid) {
                    anyhow::bail!(
                        "Business logic {} references unknown validator {}",
                        blid,
                        vid
                    );
                }
            }
        }

        Ok(())
    }

    /// Get a validator descriptor by id
    pub fn validator(&self, validator_id: &str) -> Option<&ValidatorDescriptor> {
        self.validators.get(validator_id)
    }

    /// Ordered validator ids a trade type requires
    pub fn validators_for(&self, business_logic_id: &str) -> Vec<String> {
        self.business_logic
            .get(business_logic_id)
            .map(|bl| bl.validator_ids.clone())
            .unwrap_or_default()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
