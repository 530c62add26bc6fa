//! Operator configuration
//!
//! Read once at startup from a TOML file and passed into every component.
//! The script identity, worker URL and payout settings sit at the top level;
//! transport and tuning knobs are grouped into sections that may be omitted.
//!
//! ```toml
//! script_curator = "<curator address>"
//! script_name = "alpaca"
//! marketplace_wallet = "<marketplace address>"
//! url = "http://localhost:8000/"
//! sleep_time_seconds = 30
//! min_block_confirmations = 7
//! inference_percentage_fee = 0.05
//!
//! [gateway]
//! gateway_url = "https://arweave.net"
//!
//! [execution]
//! response_format = "json"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::amount::{fraction_from_f64, Amount};
use crate::executor::ResponseFormat;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address of the curator that published the script
    pub script_curator: String,

    /// Script this operator serves
    pub script_name: String,

    /// Receives the marketplace share of every answered Request
    pub marketplace_wallet: String,

    /// Worker endpoint that executes the task
    pub url: String,

    /// Pause between cycles
    #[serde(default = "default_sleep_time")]
    pub sleep_time_seconds: u64,

    /// Registrations and payments must be buried deeper than this
    #[serde(default = "default_min_confirmations")]
    pub min_block_confirmations: u64,

    /// Fraction of the operator fee forwarded to the marketplace
    #[serde(default = "default_percentage_fee")]
    pub inference_percentage_fee: f64,

    /// Operator key file
    #[serde(default = "default_wallet_path")]
    pub wallet_path: PathBuf,

    /// Execute but never publish or pay
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub verification: VerificationConfig,

    #[serde(default)]
    pub app: AppConfig,
}

/// Ledger gateway endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    #[serde(default = "default_graphql_url")]
    pub graphql_url: String,

    /// Data uploads go here
    #[serde(default = "default_bundler_url")]
    pub bundler_url: String,

    /// Timeout for every gateway call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Results per indexer page
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            graphql_url: default_graphql_url(),
            bundler_url: default_bundler_url(),
            request_timeout_secs: default_request_timeout(),
            page_size: default_page_size(),
        }
    }
}

/// Worker call settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_execution_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub response_format: ResponseFormat,

    /// `Content-Type` of published Responses
    #[serde(default = "default_content_type")]
    pub content_type: String,

    /// Prefix prompts with earlier exchanges of the conversation
    #[serde(default)]
    pub use_context: bool,

    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_execution_timeout(),
            response_format: ResponseFormat::default(),
            content_type: default_content_type(),
            use_context: false,
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

/// Payment verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Recent Requests from a user that must each be paid
    #[serde(default = "default_request_lookback")]
    pub request_lookback: usize,

    /// Count only individually confirmed payments
    #[serde(default)]
    pub strict_payment_confirmations: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            request_lookback: default_request_lookback(),
            strict_payment_confirmations: false,
        }
    }
}

/// Marketplace application tags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,

    /// Fallback when a Request carries no `App-Version`
    #[serde(default = "default_app_version")]
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: default_app_version(),
        }
    }
}

// Defaults
fn default_sleep_time() -> u64 { 30 }
fn default_min_confirmations() -> u64 { 7 }
fn default_percentage_fee() -> f64 { 0.05 }
fn default_wallet_path() -> PathBuf { PathBuf::from("wallet.json") }
fn default_gateway_url() -> String { "https://arweave.net".to_string() }
fn default_graphql_url() -> String { "https://arweave.net/graphql".to_string() }
fn default_bundler_url() -> String { "https://node1.bundlr.network".to_string() }
fn default_request_timeout() -> u64 { 30 }
fn default_page_size() -> usize { 100 }
fn default_execution_timeout() -> u64 { 300 }
fn default_content_type() -> String { "application/json".to_string() }
fn default_max_context_tokens() -> u64 { 2048 }
fn default_request_lookback() -> usize { 10 }
fn default_app_name() -> String { "Fair Protocol".to_string() }
fn default_app_version() -> String { "0.1".to_string() }

impl Config {
    /// Minimal config for the given script; everything else defaulted.
    pub fn new(
        script_curator: impl Into<String>,
        script_name: impl Into<String>,
        marketplace_wallet: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            script_curator: script_curator.into(),
            script_name: script_name.into(),
            marketplace_wallet: marketplace_wallet.into(),
            url: url.into(),
            sleep_time_seconds: default_sleep_time(),
            min_block_confirmations: default_min_confirmations(),
            inference_percentage_fee: default_percentage_fee(),
            wallet_path: default_wallet_path(),
            dry_run: false,
            gateway: GatewayConfig::default(),
            execution: ExecutionConfig::default(),
            verification: VerificationConfig::default(),
            app: AppConfig::default(),
        }
    }

    /// Read, parse and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("script_curator", &self.script_curator),
            ("script_name", &self.script_name),
            ("marketplace_wallet", &self.marketplace_wallet),
            ("url", &self.url),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", name)));
            }
        }

        let fee = self.inference_percentage_fee;
        if !fee.is_finite() || !(0.0..=1.0).contains(&fee) {
            return Err(ConfigError::Invalid(format!(
                "inference_percentage_fee must be between 0 and 1, got {}",
                fee
            )));
        }
        if self.sleep_time_seconds == 0 {
            return Err(ConfigError::Invalid("sleep_time_seconds must be positive".into()));
        }
        if self.gateway.page_size == 0 || self.gateway.page_size > 100 {
            return Err(ConfigError::Invalid("gateway.page_size must be 1..=100".into()));
        }
        if self.execution.timeout_secs == 0 || self.gateway.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        if self.verification.request_lookback == 0 {
            return Err(ConfigError::Invalid(
                "verification.request_lookback must be positive".into(),
            ));
        }
        Ok(())
    }

    /// `inference_percentage_fee` as an exact decimal
    pub fn percentage_fee(&self) -> Result<Amount, ConfigError> {
        fraction_from_f64(self.inference_percentage_fee).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "inference_percentage_fee {} is not a number",
                self.inference_percentage_fee
            ))
        })
    }
}
