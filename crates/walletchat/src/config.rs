use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total publish attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: u32,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            backoff_multiplier: 2,
            max_backoff_ms: 4_000,
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.backoff_multiplier.max(1))
            .saturating_pow(attempt.saturating_sub(1));
        let delay = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default)]
    pub retry: RetryPolicy,

    /// How long a published message may wait for network confirmation
    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout_ms: u64,

    /// Envelopes requested per history page
    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,

    /// A conversation's delivery task exits after this long without sends
    #[serde(default = "default_outbox_idle_ms")]
    pub outbox_idle_ms: u64,
}

fn default_confirmation_timeout_ms() -> u64 {
    30_000
}

fn default_history_page_size() -> usize {
    50
}

fn default_outbox_idle_ms() -> u64 {
    60_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            confirmation_timeout_ms: default_confirmation_timeout_ms(),
            history_page_size: default_history_page_size(),
            outbox_idle_ms: default_outbox_idle_ms(),
        }
    }
}

impl ClientConfig {
    /// Load config from a JSON file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.maxAttempts must be at least 1".to_string()));
        }
        if self.history_page_size == 0 {
            return Err(Error::Config("historyPageSize must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn outbox_idle(&self) -> Duration {
        Duration::from_millis(self.outbox_idle_ms)
    }
}
