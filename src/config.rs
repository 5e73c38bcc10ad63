//! Configuration management for the bridge relayer
//!
//! Loads configuration from TOML files with environment variable substitution.
//! A `.env` file in the working directory is honoured before substitution.

use crate::chain::finality::recommended_confirmations;
use crate::error::{RelayerError, RelayerResult};

use anyhow::{Context, Result};
use ethers::signers::LocalWallet;
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    pub chains: HashMap<String, ChainConfig>,
    pub directions: Vec<DirectionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayerConfig {
    pub instance_id: String,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub max_in_flight: usize,
    pub submission_timeout_secs: u64,
    pub rpc_timeout_secs: u64,
    pub backfill_batch_size: u64,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub reconnect_attempts: u32,
    pub replacement_bump_percent: u64,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            instance_id: "relayer-0".to_string(),
            poll_interval_ms: 3_000,
            max_attempts: 5,
            max_in_flight: 8,
            submission_timeout_secs: 600,
            rpc_timeout_secs: 30,
            backfill_batch_size: 1_000,
            retry_base_ms: 2_000,
            retry_cap_ms: 300_000,
            reconnect_attempts: 5,
            replacement_bump_percent: 20,
        }
    }
}

impl RelayerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn submission_timeout(&self) -> Duration {
        Duration::from_secs(self.submission_timeout_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    File,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    /// Directory holding one `<direction>.json` document per direction
    pub dir: PathBuf,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::File,
            dir: PathBuf::from("data"),
            database_url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub ws_url: Option<String>,
    pub bridge_address: String,
    /// Blocks an event must be buried under before it is relayed
    pub confirmation_depth: Option<u64>,
    #[serde(default)]
    pub genesis_block: u64,
    #[serde(default)]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// Token the destination bridge must mint, checked at startup
    pub expected_token: Option<String>,
}

fn default_max_gas_price_gwei() -> u64 {
    500
}

fn default_gas_limit() -> u64 {
    300_000
}

impl ChainConfig {
    pub fn confirmation_depth(&self) -> u64 {
        self.confirmation_depth
            .unwrap_or_else(|| recommended_confirmations(self.chain_id))
    }

    pub fn bridge_address(&self) -> RelayerResult<Address> {
        Address::from_str(&self.bridge_address).map_err(|e| {
            RelayerError::Config(format!(
                "Invalid bridge address for chain {}: {}",
                self.name, e
            ))
        })
    }

    pub fn expected_token(&self) -> RelayerResult<Option<Address>> {
        self.expected_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| {
                Address::from_str(t).map_err(|e| {
                    RelayerError::Config(format!(
                        "Invalid expected token for chain {}: {}",
                        self.name, e
                    ))
                })
            })
            .transpose()
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    #[default]
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Name of the environment variable holding the hex private key
    pub private_key_env: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: "PRIVATE_KEY".to_string(),
        }
    }
}

impl WalletConfig {
    /// Load the relayer signing key
    pub fn load_wallet(&self) -> RelayerResult<LocalWallet> {
        let key = env::var(&self.private_key_env).map_err(|_| {
            RelayerError::Config(format!(
                "Missing signing credential: set {}",
                self.private_key_env
            ))
        })?;

        key.trim()
            .parse::<LocalWallet>()
            .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectionConfig {
    pub name: String,
    pub source: String,
    pub destination: String,
    /// Event name on the source bridge, e.g. `BridgedToSepolia`
    pub event: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Revert reason fragment the destination bridge uses for a duplicate mint
    pub already_processed_revert: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        // A missing .env is normal in production
        let _ = dotenvy::dotenv();

        let config_path = env::var("RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let settings = Self::from_toml_str(&config_str)?;
        settings.validate()?;

        Ok(settings)
    }

    /// Parse settings from TOML text, substituting `${VAR}` placeholders
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config_str = substitute_env_vars(input);
        toml::from_str(&config_str).with_context(|| "Failed to parse configuration")
    }

    /// Validate configuration
    pub fn validate(&self) -> RelayerResult<()> {
        if self.enabled_directions().is_empty() {
            return Err(RelayerError::Config(
                "At least one direction must be enabled".to_string(),
            ));
        }

        if self.relayer.max_attempts == 0 {
            return Err(RelayerError::Config("max_attempts must be positive".into()));
        }
        if self.relayer.max_in_flight == 0 {
            return Err(RelayerError::Config("max_in_flight must be positive".into()));
        }
        if self.relayer.backfill_batch_size == 0 {
            return Err(RelayerError::Config(
                "backfill_batch_size must be positive".into(),
            ));
        }

        // One signer per destination chain owns its nonce sequence
        let mut destinations = HashMap::new();
        for direction in self.enabled_directions() {
            if let Some(other) = destinations.insert(&direction.destination, &direction.name) {
                return Err(RelayerError::Config(format!(
                    "Directions {} and {} both mint on {}",
                    other, direction.name, direction.destination
                )));
            }
            if direction.source == direction.destination {
                return Err(RelayerError::Config(format!(
                    "Direction {} relays a chain onto itself",
                    direction.name
                )));
            }
            if direction.event.trim().is_empty() {
                return Err(RelayerError::Config(format!(
                    "Direction {} has no event name",
                    direction.name
                )));
            }

            for chain_name in [&direction.source, &direction.destination] {
                let chain = self.chain(chain_name)?;
                if chain.rpc_urls.is_empty() {
                    return Err(RelayerError::Config(format!(
                        "Chain {} has no RPC URLs configured",
                        chain_name
                    )));
                }
                chain.bridge_address()?;
                chain.expected_token()?;
            }
        }

        if self.ledger.backend == LedgerBackend::Postgres
            && self.ledger.database_url.as_deref().unwrap_or("").is_empty()
        {
            return Err(RelayerError::Config(
                "Postgres ledger backend needs ledger.database_url".into(),
            ));
        }

        self.wallet.load_wallet()?;

        Ok(())
    }

    /// Get list of enabled directions
    pub fn enabled_directions(&self) -> Vec<&DirectionConfig> {
        self.directions.iter().filter(|d| d.enabled).collect()
    }

    /// Get chain config by name
    pub fn chain(&self, name: &str) -> RelayerResult<&ChainConfig> {
        self.chains
            .get(name)
            .ok_or_else(|| RelayerError::Config(format!("Unknown chain {}", name)))
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
