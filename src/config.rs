//! Configuration management for the colony coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use crate::tx::ContractContext;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub coordinator: CoordinatorConfig,
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chain: ChainConfig,
    #[serde(default)]
    pub contracts: HashMap<ContractContext, ContractConfig>,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    pub instance_id: String,
    /// Send transactions as soon as they become ready
    #[serde(default = "default_true")]
    pub auto_send: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    #[serde(default = "default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,
    /// No timeout when unset
    pub receipt_timeout_secs: Option<u64>,
    #[serde(default = "default_name_check_debounce_ms")]
    pub name_check_debounce_ms: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    pub health_check_interval_secs: u64,
    #[serde(default = "default_gas_limit_buffer_percent")]
    pub gas_limit_buffer_percent: u64,
    #[serde(default = "default_gas_price_buffer_percent")]
    pub gas_price_buffer_percent: u64,
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

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    /// Suffix colony ENS names live under, e.g. `joincolony.eth`
    #[serde(default = "default_ens_suffix")]
    pub ens_suffix: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

/// ABI and default address for one contract context
#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    pub abi_path: PathBuf,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_receipt_poll_interval_ms() -> u64 {
    1_000
}

fn default_name_check_debounce_ms() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_retention_secs() -> u64 {
    86_400
}

fn default_gas_limit_buffer_percent() -> u64 {
    20
}

fn default_gas_price_buffer_percent() -> u64 {
    10
}

fn default_ens_suffix() -> String {
    "joincolony.eth".to_string()
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("COLONY_COORDINATOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse settings from TOML text
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.chain.name);
        }

        if self.coordinator.max_retries == 0 {
            anyhow::bail!("coordinator.max_retries must be at least 1");
        }

        for (name, value) in [
            ("cleanup_interval_secs", self.coordinator.cleanup_interval_secs),
            ("health_check_interval_secs", self.coordinator.health_check_interval_secs),
            ("receipt_poll_interval_ms", self.coordinator.receipt_poll_interval_ms),
        ] {
            if value == 0 {
                anyhow::bail!("coordinator.{} must be greater than 0", name);
            }
        }

        for (context, contract) in &self.contracts {
            if contract.address.as_deref().map_or(true, str::is_empty) {
                tracing::warn!(
                    "Contract context {} has no default address - records must carry an identifier",
                    context
                );
            }
        }

        Ok(())
    }

    /// Private key environment variable name
    pub fn private_key_env(&self) -> &str {
        self.wallet
            .private_key_env
            .as_deref()
            .unwrap_or("COORDINATOR_PRIVATE_KEY")
    }
}

#[cfg(test)]
impl CoordinatorConfig {
    /// Fast timings for tests
    pub fn for_tests() -> Self {
        Self {
            instance_id: "test".to_string(),
            auto_send: true,
            max_retries: 3,
            retry_delay_ms: 1,
            receipt_poll_interval_ms: 1,
            receipt_timeout_secs: Some(5),
            name_check_debounce_ms: 20,
            cleanup_interval_secs: 300,
            retention_secs: 86_400,
            health_check_interval_secs: 30,
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }
}

lazy_static! {
    static ref ENV_VAR_PATTERN: regex::Regex =
        regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
