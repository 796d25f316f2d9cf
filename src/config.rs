//! Configuration management for the HTLC solver
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub solver: SolverConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    pub networks: HashMap<String, NetworkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolverConfig {
    pub instance_id: String,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Empty URL keeps all state in process memory (dry runs only)
    #[serde(default)]
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

/// Transaction engine tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_fee_attempts: u32,
    pub fee_bump_percent: u32,
    pub confirm_poll_interval_ms: u64,
    pub confirm_compaction_polls: u32,
    pub call_timeout_secs: u64,
    pub step_ceiling_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_fee_attempts: 5,
            fee_bump_percent: 20,
            confirm_poll_interval_ms: 5_000,
            confirm_compaction_polls: 100,
            call_timeout_secs: 30,
            step_ceiling_secs: 6 * 60 * 60,
            retry_max_attempts: 5,
            retry_initial_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
        }
    }
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn step_ceiling(&self) -> Duration {
        Duration::from_secs(self.step_ceiling_secs)
    }

    pub fn confirm_poll_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_interval_ms)
    }
}

/// Node resiliency scoring parameters
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub initial_score: i32,
    pub reward: i32,
    pub penalty: i32,
    pub min_score: i32,
    pub max_score: i32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            initial_score: 50,
            reward: 5,
            penalty: 5,
            min_score: 0,
            max_score: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub family: NetworkFamily,
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub htlc_contract_address: String,
    /// Symbol of the gas token (e.g. ETH)
    pub native_asset: String,
    /// Token symbol -> contract address
    #[serde(default)]
    pub tokens: HashMap<String, String>,
    pub confirmation_blocks: u64,
    pub fee_strategy: FeeStrategy,
    pub max_gas_price_gwei: u64,
    /// Environment variable holding the signing key for this network
    pub private_key_env: Option<String>,
    pub listener: ListenerConfig,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub block_batch_size: u64,
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub resume_from_block: Option<u64>,
    #[serde(default = "default_compaction_iterations")]
    pub compaction_iterations: u32,
}

fn default_compaction_iterations() -> u32 {
    200
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NetworkFamily {
    Evm,
    Starknet,
    Solana,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeeStrategy {
    Legacy,
    Eip1559,
    Arbitrum,
    Optimism,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("HTLC_SOLVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse settings from a TOML document
    pub fn from_toml(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_networks().is_empty() {
            anyhow::bail!("At least one network must be enabled");
        }

        for (name, network) in &self.networks {
            if !network.enabled {
                continue;
            }
            if network.rpc_urls.is_empty() {
                anyhow::bail!("Network {} has no RPC URLs configured", name);
            }
            if network.listener.block_batch_size == 0 {
                anyhow::bail!("Network {} has a zero block batch size", name);
            }
            if network.htlc_contract_address.is_empty() {
                tracing::warn!("Network {} has no HTLC contract address - will skip", name);
            }
        }

        if self.engine.max_fee_attempts == 0 {
            anyhow::bail!("engine.max_fee_attempts must be at least 1");
        }

        Ok(())
    }

    /// Get list of enabled networks
    pub fn enabled_networks(&self) -> Vec<(&String, &NetworkConfig)> {
        self.networks.iter().filter(|(_, n)| n.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
