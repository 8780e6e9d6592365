use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;

use crate::transfer::config::SagaConfig;
use crate::transfer::worker::WorkerConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Emit per-transition debug spans from the saga modules
    pub enable_tracing: bool,
    #[serde(default)]
    pub saga: SagaConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    /// Accounts opened in the in-process ledger at startup
    #[serde(default)]
    pub seed_accounts: Vec<SeedAccount>,
}

/// Durable aggregate journal
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JournalConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "./data/transfers.journal".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SeedAccount {
    pub id: String,
    pub balance: Decimal,
    pub currency: String,
    #[serde(default)]
    pub frozen: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "transfer_saga.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            enable_tracing: false,
            saga: SagaConfig::default(),
            worker: WorkerConfig::default(),
            journal: JournalConfig::default(),
            seed_accounts: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}
