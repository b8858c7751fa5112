use std::fs;

use serde::Deserialize;
use thiserror::Error;

use crate::events::{RetryPolicy, SettlementCreated};
use crate::fee::FeeSchedule;
use crate::settlement::{BulkScanConfig, WorkerConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL for both ledgers and the dead-letter table; in-memory when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub fees: FeeSchedule,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub recovery: WorkerConfig,
    #[serde(default)]
    pub bulk_scan: BulkScanConfig,
    #[serde(default)]
    pub seed: SeedConfig,
}

/// Startup input for local runs: wallet accounts to open and purchases to
/// publish as `SettlementCreated` once the consumers are up
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SeedConfig {
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub purchases: Vec<SettlementCreated>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    /// Bounded channel size per topic
    pub channel_capacity: usize,
    /// Concurrent handler invocations per consumer
    pub max_in_flight: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            max_in_flight: 16,
        }
    }
}

impl AppConfig {
    /// Load `config/{env}.yaml`
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fees.validate().map_err(ConfigError::Invalid)?;
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be >= 1".into()));
        }
        if self.consumer.channel_capacity == 0 || self.consumer.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "consumer.channel_capacity and consumer.max_in_flight must be >= 1".into(),
            ));
        }
        if self.recovery.batch_size == 0 || self.bulk_scan.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be >= 1".into()));
        }
        Ok(())
    }
}
