use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::models::RewardSchedule;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub rewards: RewardsConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    /// Accept any well-formed signature without recovering the signer.
    /// Never enable outside local development.
    #[serde(default)]
    pub allow_unverified_signatures: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_provider")]
    pub default_provider: String,
    #[serde(default = "default_local_path")]
    pub local_path: String,
    #[serde(default)]
    pub web3storage_token: String,
    #[serde(default = "default_web3storage_api_url")]
    pub web3storage_api_url: String,
    #[serde(default = "default_web3storage_gateway_url")]
    pub web3storage_gateway_url: String,
    #[serde(default)]
    pub ipfs_api_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerMode {
    Rpc,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_mode")]
    pub mode: LedgerMode,
    #[serde(default)]
    pub rpc_url: String,
    #[serde(default)]
    pub contract_address: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default)]
    pub gas_price_wei: Option<u64>,
    #[serde(default = "default_record_gas_limit")]
    pub record_gas_limit: u64,
    #[serde(default = "default_claim_gas_limit")]
    pub claim_gas_limit: u64,
    #[serde(default = "default_grant_gas_limit")]
    pub grant_gas_limit: u64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewardsConfig {
    #[serde(default = "default_base_reward")]
    pub base_wei: u64,
    #[serde(default = "default_size_multiplier")]
    pub size_multiplier_wei: u64,
    #[serde(default = "default_encryption_bonus")]
    pub encryption_bonus_wei: u64,
    #[serde(default = "default_auto_claim")]
    pub auto_claim: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WebhookConfig {
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_requests")]
    pub requests_per_window: u32,
    #[serde(default = "default_rate_limit_window")]
    pub window_secs: u64,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_db_path() -> String {
    "data/vaultchain.db".to_string()
}

fn default_storage_provider() -> String {
    "local".to_string()
}

fn default_local_path() -> String {
    "data/blobs".to_string()
}

fn default_web3storage_api_url() -> String {
    "https://api.web3.storage".to_string()
}

fn default_web3storage_gateway_url() -> String {
    "https://w3s.link".to_string()
}

fn default_ledger_mode() -> LedgerMode {
    LedgerMode::Memory
}

fn default_chain_id() -> u64 {
    314159 // Filecoin Calibration
}

fn default_record_gas_limit() -> u64 {
    300_000
}

fn default_claim_gas_limit() -> u64 {
    200_000
}

fn default_grant_gas_limit() -> u64 {
    250_000
}

fn default_call_timeout() -> u64 {
    30
}

fn default_base_reward() -> u64 {
    10_000_000_000_000_000 // 0.01 FIL
}

fn default_size_multiplier() -> u64 {
    1_000_000_000_000 // per KiB
}

fn default_encryption_bonus() -> u64 {
    5_000_000_000_000_000 // 0.005 FIL
}

fn default_auto_claim() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    10_000
}

fn default_rate_limit_requests() -> u32 {
    100
}

fn default_rate_limit_window() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_provider: default_storage_provider(),
            local_path: default_local_path(),
            web3storage_token: String::new(),
            web3storage_api_url: default_web3storage_api_url(),
            web3storage_gateway_url: default_web3storage_gateway_url(),
            ipfs_api_url: String::new(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            mode: default_ledger_mode(),
            rpc_url: String::new(),
            contract_address: String::new(),
            private_key: String::new(),
            chain_id: default_chain_id(),
            gas_price_wei: None,
            record_gas_limit: default_record_gas_limit(),
            claim_gas_limit: default_claim_gas_limit(),
            grant_gas_limit: default_grant_gas_limit(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            base_wei: default_base_reward(),
            size_multiplier_wei: default_size_multiplier(),
            encryption_bonus_wei: default_encryption_bonus(),
            auto_claim: default_auto_claim(),
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: default_rate_limit_requests(),
            window_secs: default_rate_limit_window(),
        }
    }
}

impl LedgerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl RewardsConfig {
    pub fn schedule(&self) -> RewardSchedule {
        RewardSchedule {
            base: self.base_wei as u128,
            size_multiplier: self.size_multiplier_wei as u128,
            encryption_bonus: self.encryption_bonus_wei as u128,
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides();
        config.validate()?;
        config.ensure_directories()?;
        tracing::info!(
            "Ledger mode: {:?}, storage provider: {}",
            config.ledger.mode,
            config.storage.default_provider
        );
        Ok(config)
    }

    /// Load configuration from vaultchain.toml or config.toml
    fn load_from_file() -> anyhow::Result<Self> {
        let config_paths = ["vaultchain.toml", "config.toml", "data/vaultchain.toml"];

        for path in config_paths {
            if Path::new(path).exists() {
                let content = fs::read_to_string(path)?;
                let config: Config = toml::from_str(&content)?;
                tracing::info!("Loaded configuration from {}", path);
                return Ok(config);
            }
        }

        tracing::info!("No configuration file found, using defaults");
        Ok(Config::default())
    }

    /// Apply environment variable overrides
    /// Format: VC_CONF_<SECTION>_<KEY>
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_into<T: std::str::FromStr>(val: Option<String>, target: &mut T) {
            if let Some(parsed) = val.and_then(|v| v.trim().parse().ok()) {
                *target = parsed;
            }
        }

        // Server overrides
        if let Some(val) = lookup("VC_CONF_SERVER_HOST") {
            self.server.host = val;
        }
        parse_into(lookup("VC_CONF_SERVER_PORT"), &mut self.server.port);
        parse_into(
            lookup("VC_CONF_SERVER_MAX_UPLOAD_BYTES"),
            &mut self.server.max_upload_bytes,
        );

        // Database overrides
        if let Some(val) = lookup("VC_CONF_DATABASE_PATH") {
            self.database.path = val;
        }

        parse_into(
            lookup("VC_CONF_AUTH_ALLOW_UNVERIFIED_SIGNATURES"),
            &mut self.auth.allow_unverified_signatures,
        );

        // Storage overrides
        if let Some(val) = lookup("VC_CONF_STORAGE_DEFAULT_PROVIDER") {
            self.storage.default_provider = val;
        }
        if let Some(val) = lookup("VC_CONF_STORAGE_LOCAL_PATH") {
            self.storage.local_path = val;
        }
        if let Some(val) = lookup("VC_CONF_STORAGE_WEB3STORAGE_TOKEN") {
            self.storage.web3storage_token = val;
        }
        if let Some(val) = lookup("VC_CONF_STORAGE_IPFS_API_URL") {
            self.storage.ipfs_api_url = val;
        }

        // Ledger overrides
        if let Some(val) = lookup("VC_CONF_LEDGER_MODE") {
            match val.to_lowercase().as_str() {
                "rpc" => self.ledger.mode = LedgerMode::Rpc,
                "memory" => self.ledger.mode = LedgerMode::Memory,
                other => tracing::warn!("Ignoring unknown ledger mode: {}", other),
            }
        }
        if let Some(val) = lookup("VC_CONF_LEDGER_RPC_URL") {
            self.ledger.rpc_url = val;
        }
        if let Some(val) = lookup("VC_CONF_LEDGER_CONTRACT_ADDRESS") {
            self.ledger.contract_address = val;
        }
        if let Some(val) = lookup("VC_CONF_LEDGER_PRIVATE_KEY") {
            self.ledger.private_key = val;
        }
        parse_into(lookup("VC_CONF_LEDGER_CHAIN_ID"), &mut self.ledger.chain_id);
        parse_into(
            lookup("VC_CONF_LEDGER_CALL_TIMEOUT_SECS"),
            &mut self.ledger.call_timeout_secs,
        );

        // Reward overrides
        parse_into(lookup("VC_CONF_REWARDS_BASE_WEI"), &mut self.rewards.base_wei);
        parse_into(
            lookup("VC_CONF_REWARDS_SIZE_MULTIPLIER_WEI"),
            &mut self.rewards.size_multiplier_wei,
        );
        parse_into(
            lookup("VC_CONF_REWARDS_ENCRYPTION_BONUS_WEI"),
            &mut self.rewards.encryption_bonus_wei,
        );
        parse_into(lookup("VC_CONF_REWARDS_AUTO_CLAIM"), &mut self.rewards.auto_claim);

        parse_into(
            lookup("VC_CONF_SETTLEMENT_MAX_ATTEMPTS"),
            &mut self.settlement.max_attempts,
        );

        if let Some(val) = lookup("VC_CONF_WEBHOOK_SECRET") {
            self.webhook.secret = val;
        }

        parse_into(
            lookup("VC_CONF_RATE_LIMIT_REQUESTS_PER_WINDOW"),
            &mut self.rate_limit.requests_per_window,
        );
        parse_into(
            lookup("VC_CONF_RATE_LIMIT_WINDOW_SECS"),
            &mut self.rate_limit.window_secs,
        );
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.ledger.mode == LedgerMode::Rpc {
            if self.ledger.rpc_url.is_empty() {
                anyhow::bail!("ledger.rpc_url is required in rpc mode");
            }
            if self.ledger.contract_address.is_empty() {
                anyhow::bail!("ledger.contract_address is required in rpc mode");
            }
            if self.ledger.private_key.is_empty() {
                anyhow::bail!("ledger.private_key is required in rpc mode");
            }
        }
        if self.settlement.max_attempts == 0 {
            anyhow::bail!("settlement.max_attempts must be at least 1");
        }
        if self.auth.allow_unverified_signatures {
            tracing::warn!("Signature verification is DISABLED; do not run this in production");
        }
        if self.webhook.secret.is_empty() {
            tracing::warn!("webhook.secret is empty; pushed ledger events will be rejected");
        }
        Ok(())
    }

    /// Ensure required directories exist
    fn ensure_directories(&self) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(&self.database.path).parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&self.storage.local_path)?;
        Ok(())
    }
}
