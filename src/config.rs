use std::env;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_FRESHNESS_WINDOW_SECS: u64 = 10 * 60;
pub const DEFAULT_CLAIM_INTERVAL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_INCENTIVE: u64 = 1;

/// Runtime configuration for the reward ledger and its CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RewardConfig {
    pub claim: ClaimConfig,
    pub incentives: IncentiveConfig,
    pub logging: LoggingConfig,
    /// Environment variables applied by [`RewardConfig::load`].
    #[serde(skip)]
    pub env_overrides: Vec<&'static str>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClaimConfig {
    /// Maximum age of a signed timestamp, inclusive.
    pub freshness_window_secs: u64,
    /// Minimum spacing between two paid claims of one student, inclusive.
    pub claim_interval_secs: u64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            freshness_window_secs: DEFAULT_FRESHNESS_WINDOW_SECS,
            claim_interval_secs: DEFAULT_CLAIM_INTERVAL_SECS,
        }
    }
}

/// Incentive amounts a freshly created ledger starts with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IncentiveConfig {
    pub student: u64,
    pub school: u64,
}

impl Default for IncentiveConfig {
    fn default() -> Self {
        Self {
            student: DEFAULT_INCENTIVE,
            school: DEFAULT_INCENTIVE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// error, warn, info, debug or trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn max_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

impl RewardConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("invalid reward ledger configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(level) = var("REWARD_LEDGER_LOG_LEVEL") {
            self.logging.level = level;
            self.env_overrides.push("REWARD_LEDGER_LOG_LEVEL");
        }
        if let Some(secs) = var("REWARD_LEDGER_FRESHNESS_SECS") {
            self.claim.freshness_window_secs = secs
                .parse()
                .context("Invalid REWARD_LEDGER_FRESHNESS_SECS value")?;
            self.env_overrides.push("REWARD_LEDGER_FRESHNESS_SECS");
        }
        if let Some(secs) = var("REWARD_LEDGER_CLAIM_INTERVAL_SECS") {
            self.claim.claim_interval_secs = secs
                .parse()
                .context("Invalid REWARD_LEDGER_CLAIM_INTERVAL_SECS value")?;
            self.env_overrides.push("REWARD_LEDGER_CLAIM_INTERVAL_SECS");
        }
        Ok(())
    }

    /// Reports the effective settings. Call once a subscriber is installed.
    pub fn log_summary(&self) {
        info!(
            freshness_window_secs = self.claim.freshness_window_secs,
            claim_interval_secs = self.claim.claim_interval_secs,
            student_incentive = self.incentives.student,
            school_incentive = self.incentives.school,
            level = %self.logging.level,
            "configuration loaded"
        );
        for key in &self.env_overrides {
            info!(%key, "overridden from environment");
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.claim.freshness_window_secs == 0 {
            bail!("claim.freshness_window_secs must be greater than zero");
        }
        if self.claim.claim_interval_secs == 0 {
            bail!("claim.claim_interval_secs must be greater than zero");
        }
        Ok(())
    }
}
