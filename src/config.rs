use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coinbase::{Recipient, RewardType};
use crate::error_handling::RetryConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientConfig {
    pub script_hex: String,
    pub fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Sigma protocol
    pub sigma_sk_hex: String,
    pub total_rounds: usize,
    pub randomness_path: PathBuf,
    pub randomness_timeout_ms: u64,
    pub proof_path: PathBuf,

    // Coinbase
    pub pool_address_script: String,
    pub extranonce_placeholder: String,
    pub extranonce1_marker: String,
    pub reward_type: RewardType,
    pub tx_messages: bool,
    pub recipients: Vec<RecipientConfig>,
    pub coinbase_single_sha256: bool,
    pub share_multiplier: f64,
    pub emit_invalid_block_hashes: bool,

    // Upstream daemon
    pub daemon_url: String,
    pub daemon_user: Option<String>,
    pub daemon_password: Option<String>,
    pub block_poll_interval_ms: u64,
    pub job_rebroadcast_ms: u64,

    // Monitoring and logging
    pub status_port: u16,
    pub log_level: String,

    // Error handling and recovery
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_recovery_ms: u64,

    // Security
    pub rate_limit_per_second: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sigma_sk_hex: String::new(),
            total_rounds: 5,
            randomness_path: PathBuf::from("randomness.txt"),
            randomness_timeout_ms: 600_000,
            proof_path: PathBuf::from("result.json"),

            pool_address_script: String::new(),
            extranonce_placeholder: "f000000faa".to_string(),
            extranonce1_marker: "deadc0de".to_string(),
            reward_type: RewardType::Pow,
            tx_messages: false,
            recipients: Vec::new(),
            coinbase_single_sha256: false,
            share_multiplier: 1.0,
            emit_invalid_block_hashes: false,

            daemon_url: "http://127.0.0.1:18443".to_string(),
            daemon_user: None,
            daemon_password: None,
            block_poll_interval_ms: 1000,
            job_rebroadcast_ms: 55_000,

            status_port: 8090,
            log_level: "info".to_string(),

            max_retries: 3,
            retry_delay_ms: 1000,
            circuit_breaker_threshold: 5,
            circuit_breaker_recovery_ms: 60_000,

            rate_limit_per_second: 50,
        }
    }
}

fn parse<T: FromStr>(key: &str, val: String) -> Result<T, ConfigError> {
    val.parse()
        .map_err(|_| ConfigError::InvalidEnvVar(key.to_string(), val))
}

fn parse_recipients(val: &str) -> Result<Vec<RecipientConfig>, ConfigError> {
    val.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (script, fraction) = entry.split_once(':').ok_or_else(|| {
                ConfigError::InvalidEnvVar("RECIPIENTS".to_string(), entry.to_string())
            })?;
            Ok(RecipientConfig {
                script_hex: script.to_string(),
                fraction: parse("RECIPIENTS", fraction.to_string())?,
            })
        })
        .collect()
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.len() % 2 == 0 && s.chars().all(|c| c.is_ascii_hexdigit())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key/value source; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        // Required configuration
        config.sigma_sk_hex = lookup("SIGMA_SK_HEX")
            .ok_or_else(|| ConfigError::MissingEnvVar("SIGMA_SK_HEX".to_string()))?;
        config.pool_address_script = lookup("POOL_ADDRESS_SCRIPT")
            .ok_or_else(|| ConfigError::MissingEnvVar("POOL_ADDRESS_SCRIPT".to_string()))?;

        // Sigma protocol
        if let Some(val) = lookup("TOTAL_ROUNDS") {
            config.total_rounds = parse("TOTAL_ROUNDS", val)?;
        }
        if let Some(val) = lookup("RANDOMNESS_PATH") {
            config.randomness_path = PathBuf::from(val);
        }
        if let Some(val) = lookup("RANDOMNESS_TIMEOUT_MS") {
            config.randomness_timeout_ms = parse("RANDOMNESS_TIMEOUT_MS", val)?;
        }
        if let Some(val) = lookup("PROOF_PATH") {
            config.proof_path = PathBuf::from(val);
        }

        // Coinbase
        if let Some(val) = lookup("EXTRANONCE_PLACEHOLDER") {
            config.extranonce_placeholder = val;
        }
        if let Some(val) = lookup("EXTRANONCE1_MARKER") {
            config.extranonce1_marker = val;
        }
        if let Some(val) = lookup("REWARD_TYPE") {
            config.reward_type = match val.to_ascii_uppercase().as_str() {
                "POW" => RewardType::Pow,
                "POS" => RewardType::Pos,
                _ => return Err(ConfigError::InvalidEnvVar("REWARD_TYPE".to_string(), val)),
            };
        }
        if let Some(val) = lookup("TX_MESSAGES") {
            config.tx_messages = val == "1";
        }
        if let Some(val) = lookup("RECIPIENTS") {
            config.recipients = parse_recipients(&val)?;
        }
        if let Some(val) = lookup("COINBASE_SINGLE_SHA256") {
            config.coinbase_single_sha256 = val == "1";
        }
        if let Some(val) = lookup("SHARE_MULTIPLIER") {
            config.share_multiplier = parse("SHARE_MULTIPLIER", val)?;
        }
        if let Some(val) = lookup("EMIT_INVALID_BLOCK_HASHES") {
            config.emit_invalid_block_hashes = val == "1";
        }

        // Upstream daemon
        if let Some(val) = lookup("DAEMON_URL") {
            config.daemon_url = val;
        }
        config.daemon_user = lookup("DAEMON_USER");
        config.daemon_password = lookup("DAEMON_PASSWORD");
        if let Some(val) = lookup("BLOCK_POLL_INTERVAL_MS") {
            config.block_poll_interval_ms = parse("BLOCK_POLL_INTERVAL_MS", val)?;
        }
        if let Some(val) = lookup("JOB_REBROADCAST_MS") {
            config.job_rebroadcast_ms = parse("JOB_REBROADCAST_MS", val)?;
        }

        // Monitoring
        if let Some(val) = lookup("STATUS_PORT") {
            config.status_port = parse("STATUS_PORT", val)?;
        }
        if let Some(val) = lookup("LOG_LEVEL") {
            config.log_level = val;
        }

        // Error handling
        if let Some(val) = lookup("MAX_RETRIES") {
            config.max_retries = parse("MAX_RETRIES", val)?;
        }
        if let Some(val) = lookup("RETRY_DELAY_MS") {
            config.retry_delay_ms = parse("RETRY_DELAY_MS", val)?;
        }
        if let Some(val) = lookup("CIRCUIT_BREAKER_THRESHOLD") {
            config.circuit_breaker_threshold = parse("CIRCUIT_BREAKER_THRESHOLD", val)?;
        }
        if let Some(val) = lookup("CIRCUIT_BREAKER_RECOVERY_MS") {
            config.circuit_breaker_recovery_ms = parse("CIRCUIT_BREAKER_RECOVERY_MS", val)?;
        }

        // Security
        if let Some(val) = lookup("RATE_LIMIT_PER_SECOND") {
            config.rate_limit_per_second = parse("RATE_LIMIT_PER_SECOND", val)?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sk = self.sigma_sk_hex.trim_start_matches("0x");
        if sk.len() != 64 || !is_hex(sk) {
            return Err(ConfigError::ValidationError("SIGMA_SK_HEX must be 64 hex characters".to_string()));
        }

        if !is_hex(&self.pool_address_script) {
            return Err(ConfigError::ValidationError("POOL_ADDRESS_SCRIPT must be hex".to_string()));
        }

        if self.total_rounds == 0 {
            return Err(ConfigError::ValidationError("TOTAL_ROUNDS must be greater than 0".to_string()));
        }

        if !is_hex(&self.extranonce_placeholder) || !is_hex(&self.extranonce1_marker) {
            return Err(ConfigError::ValidationError(
                "EXTRANONCE_PLACEHOLDER and EXTRANONCE1_MARKER must be hex".to_string(),
            ));
        }

        if self.extranonce1_marker.len() != 8 {
            return Err(ConfigError::ValidationError("EXTRANONCE1_MARKER must be 4 bytes".to_string()));
        }

        if self.extranonce_placeholder.len() <= self.extranonce1_marker.len() {
            return Err(ConfigError::ValidationError(
                "EXTRANONCE_PLACEHOLDER must be longer than EXTRANONCE1_MARKER".to_string(),
            ));
        }

        let mut total_fraction = 0.0;
        for recipient in &self.recipients {
            if !is_hex(&recipient.script_hex) {
                return Err(ConfigError::ValidationError(format!(
                    "recipient script {} is not hex",
                    recipient.script_hex
                )));
            }
            if !(0.0..=1.0).contains(&recipient.fraction) {
                return Err(ConfigError::ValidationError(format!(
                    "recipient fraction {} out of range",
                    recipient.fraction
                )));
            }
            total_fraction += recipient.fraction;
        }
        if total_fraction > 1.0 {
            return Err(ConfigError::ValidationError("recipient fractions exceed 1.0".to_string()));
        }

        if self.share_multiplier <= 0.0 {
            return Err(ConfigError::ValidationError("SHARE_MULTIPLIER must be positive".to_string()));
        }

        if !self.daemon_url.starts_with("http") {
            return Err(ConfigError::ValidationError("DAEMON_URL must be a valid HTTP URL".to_string()));
        }

        if self.block_poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError("BLOCK_POLL_INTERVAL_MS must be greater than 0".to_string()));
        }

        if self.circuit_breaker_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "CIRCUIT_BREAKER_THRESHOLD must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn recipients(&self) -> Result<Vec<Recipient>, ConfigError> {
        self.recipients
            .iter()
            .map(|r| {
                let script = hex::decode(&r.script_hex).map_err(|e| {
                    ConfigError::InvalidEnvVar("RECIPIENTS".to_string(), e.to_string())
                })?;
                Ok(Recipient { script, fraction: r.fraction })
            })
            .collect()
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            ..RetryConfig::default()
        }
    }

    pub fn circuit_breaker_recovery(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_recovery_ms)
    }

    pub fn randomness_timeout(&self) -> Duration {
        Duration::from_millis(self.randomness_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.block_poll_interval_ms)
    }

    pub fn rebroadcast_interval(&self) -> Duration {
        Duration::from_millis(self.job_rebroadcast_ms)
    }
}
