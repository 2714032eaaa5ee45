//! Configuration management for the swap coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::TimelockSchedule;
use crate::coordination::swap::SwapConfig;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "SWAP_COORDINATOR_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub timelocks: TimelockSchedule,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    pub chains: HashMap<String, ChainConfig>,
    pub demo: Option<DemoConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    pub instance_id: String,
    /// Interval between GetState reconciliations of a monitored escrow
    pub poll_interval_ms: u64,
    /// Deadline for every chain call
    pub call_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub max_backoff_ms: u64,
    pub health_check_interval_secs: u64,
}

impl CoordinatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Backoff before retry `attempt` (0-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self.retry_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            instance_id: "coordinator-1".to_string(),
            poll_interval_ms: 5_000,
            call_timeout_ms: 30_000,
            retry_delay_ms: 500,
            max_backoff_ms: 30_000,
            health_check_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JournalConfig {
    pub enabled: bool,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: String,
    pub name: String,
    pub kind: ChainKind,
    pub enabled: bool,
}

/// Chain adapter implementation
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    /// In-process ledger
    Simulated,
}

/// Swap run once at startup
#[derive(Debug, Clone, Deserialize)]
pub struct DemoConfig {
    pub enabled: bool,
    pub swap: SwapConfig,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().len() < 2 {
            anyhow::bail!("At least two chains must be enabled");
        }

        let mut seen = HashMap::new();
        for (name, chain) in self.enabled_chains() {
            if chain.chain_id.trim().is_empty() {
                anyhow::bail!("Chain {} has an empty chain_id", name);
            }
            if let Some(other) = seen.insert(chain.chain_id.as_str(), name) {
                anyhow::bail!("Chains {} and {} share chain_id {}", other, name, chain.chain_id);
            }
        }

        let coordinator = &self.coordinator;
        if coordinator.poll_interval_ms == 0 || coordinator.call_timeout_ms == 0 {
            anyhow::bail!("Coordinator poll interval and call timeout must be positive");
        }
        if coordinator.retry_delay_ms > coordinator.max_backoff_ms {
            anyhow::bail!("retry_delay_ms must not exceed max_backoff_ms");
        }

        self.timelocks
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid timelock schedule: {}", e))?;

        if self.journal.enabled && self.journal.path.is_none() {
            anyhow::bail!("Journal is enabled but has no path");
        }

        if let Some(demo) = self.demo.as_ref().filter(|d| d.enabled) {
            for chain in [&demo.swap.src_chain, &demo.swap.dst_chain] {
                if self.get_chain_by_id(chain.as_str()).is_none() {
                    anyhow::bail!("Demo swap references unknown chain {}", chain);
                }
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        let mut chains: Vec<_> = self.chains.iter().filter(|(_, c)| c.enabled).collect();
        chains.sort_by(|a, b| a.0.cmp(b.0));
        chains
    }

    /// Get enabled chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: &str) -> Option<&ChainConfig> {
        self.chains
            .values()
            .find(|c| c.enabled && c.chain_id == chain_id)
    }
}

lazy_static! {
    static ref ENV_VAR: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is valid");
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
