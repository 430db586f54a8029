//! Configuration management for the loan relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::relay::Backoff;
use crate::types::Domain;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub lending: LendingConfig,
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub source: ChainConfig,
    pub destination: ChainConfig,
    /// Destination chain names offered to borrowers, mapped to relay domains
    #[serde(default)]
    pub routes: HashMap<String, Domain>,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub devnet: DevnetConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Real chains through JSON-RPC and a mailbox contract
    #[default]
    Evm,
    /// In-process ledgers and relay
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: Option<String>,
    #[serde(default)]
    pub transport: TransportMode,
    pub poll_interval_ms: u64,
    /// Engine timer for retries, timeouts and default checks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Attempt budget per phase (lock, issue dispatch, release dispatch)
    pub max_dispatch_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Wait for `Issued` after an issue dispatch
    pub issue_timeout_secs: u64,
    /// Wait for `Released` after a release dispatch
    pub release_timeout_secs: u64,
    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout_secs: u64,
    pub health_check_interval_secs: u64,
}

fn default_receipt_timeout() -> u64 {
    120
}

fn default_tick_interval() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LendingConfig {
    pub interest_rate_bps: u32,
    pub min_duration_days: u32,
    pub max_duration_days: u32,
}

impl Default for LendingConfig {
    fn default() -> Self {
        Self {
            interest_rate_bps: 500,
            min_duration_days: 7,
            max_duration_days: 90,
        }
    }
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

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub domain: Domain,
    pub chain_id: u64,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    pub confirmation_blocks: Option<u64>,
    #[serde(default)]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas")]
    pub max_gas_price_gwei: u64,
    #[serde(default)]
    pub collateral_manager: String,
    #[serde(default)]
    pub ip_registry: String,
    #[serde(default)]
    pub loan_manager: String,
    #[serde(default)]
    pub mailbox: String,
}

fn default_max_gas() -> u64 {
    200
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    #[default]
    Eip1559,
    Arbitrum,
    Optimism,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    pub gateway_url: String,
    pub timeout_secs: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            gateway_url: "https://ipfs.io/ipfs/".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WalletConfig {
    pub private_key_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevnetConfig {
    /// Destination pool liquidity in wei
    pub liquidity_wei: String,
    #[serde(default)]
    pub assets: Vec<DevnetAsset>,
}

impl Default for DevnetConfig {
    fn default() -> Self {
        Self {
            liquidity_wei: "100000000000000000000".to_string(),
            assets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevnetAsset {
    pub asset_id: u64,
    pub owner: String,
    pub token_uri: String,
}

impl Settings {
    /// Load settings from the file named by `IPLOAN_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("IPLOAN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));
        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.source.domain == self.destination.domain {
            anyhow::bail!(
                "Source and destination share domain {}",
                self.source.domain
            );
        }

        if self.relayer.max_dispatch_attempts == 0 {
            anyhow::bail!("max_dispatch_attempts must be at least 1");
        }

        if self.relayer.retry_base_delay_ms > self.relayer.retry_max_delay_ms {
            anyhow::bail!("retry_base_delay_ms exceeds retry_max_delay_ms");
        }

        if self.lending.min_duration_days == 0
            || self.lending.min_duration_days > self.lending.max_duration_days
        {
            anyhow::bail!(
                "Invalid loan duration bounds: {}..{} days",
                self.lending.min_duration_days,
                self.lending.max_duration_days
            );
        }

        if self.relayer.transport == TransportMode::Evm {
            for chain in [&self.source, &self.destination] {
                if chain.rpc_urls.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URLs configured", chain.name);
                }
                if chain.mailbox.is_empty() {
                    anyhow::bail!("Chain {} has no mailbox address", chain.name);
                }
            }
            if self.source.collateral_manager.is_empty() || self.source.ip_registry.is_empty() {
                anyhow::bail!(
                    "Source chain {} needs collateral_manager and ip_registry addresses",
                    self.source.name
                );
            }
            if self.destination.loan_manager.is_empty() {
                anyhow::bail!(
                    "Destination chain {} needs a loan_manager address",
                    self.destination.name
                );
            }
        }

        Ok(())
    }

    /// Whether borrowers can select this relayer's destination by name
    pub fn has_route_to_destination(&self) -> bool {
        self.routes
            .values()
            .any(|domain| *domain == self.destination.domain)
    }

    /// Resolve a destination chain name (as chosen by a borrower) to a relay domain
    pub fn resolve_route(&self, chain_name: &str) -> Option<Domain> {
        let wanted = chain_name.to_ascii_lowercase();
        self.routes
            .iter()
            .find(|(name, _)| name.to_ascii_lowercase() == wanted)
            .map(|(_, domain)| *domain)
    }

    pub fn instance_id(&self) -> String {
        self.relayer
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

impl RelayerConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn issue_timeout(&self) -> Duration {
        Duration::from_secs(self.issue_timeout_secs)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_secs(self.release_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }
}

lazy_static! {
    static ref ENV_VAR: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is valid");
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
pub(crate) const LOCAL_TEST_CONFIG: &str = r#"
[relayer]
transport = "local"
poll_interval_ms = 1000
max_dispatch_attempts = 5
retry_base_delay_ms = 5000
retry_max_delay_ms = 300000
issue_timeout_secs = 600
release_timeout_secs = 600
health_check_interval_secs = 30

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[source]
name = "camp"
domain = 123420001
chain_id = 123420001

[destination]
name = "arbitrum"
domain = 42161
chain_id = 42161

[routes]
arbitrum = 42161
scroll = 534352
"#;

/// Local-transport settings shared by tests across modules
#[cfg(test)]
pub(crate) fn local_test_settings() -> Settings {
    Settings::parse(LOCAL_TEST_CONFIG).expect("test config parses")
}
