//! Volume watcher configuration.
//!
//! Loaded from YAML, then overlaid with environment variables:
//! - `RK_VOLUMEWATCHER_STATE_QPS`: state queries per second for discovery.
//! - `RK_VOLUMEWATCHER_BATCH_MS`: claim update batch window in milliseconds.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Default cap on discovery reads against the state store.
pub const LIMIT_STATE_QUERIES_PER_SECOND: f64 = 100.0;

/// Default window over which claim updates from all volumes are coalesced.
pub const CROSS_VOLUME_UPDATE_BATCH_DURATION: Duration = Duration::from_millis(250);

/// Floor on the spacing between discovery reads.
const MIN_STATE_QUERY_INTERVAL: Duration = Duration::from_millis(1);

const ENV_STATE_QPS: &str = "RK_VOLUMEWATCHER_STATE_QPS";
const ENV_BATCH_MS: &str = "RK_VOLUMEWATCHER_BATCH_MS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub state_queries_per_second: f64,
    pub update_batch_duration_ms: u64,
    /// Attempts per detach RPC, including the first.
    pub detach_attempts: u32,
    pub detach_timeout_ms: u64,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            state_queries_per_second: LIMIT_STATE_QUERIES_PER_SECOND,
            update_batch_duration_ms: CROSS_VOLUME_UPDATE_BATCH_DURATION.as_millis() as u64,
            detach_attempts: 3,
            detach_timeout_ms: 10_000,
            retry_backoff_base_ms: 100,
            retry_backoff_max_ms: 2_000,
        }
    }
}

impl WatcherConfig {
    /// Read a YAML config file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let cfg = Self::from_yaml(&content)?;
        cfg.with_env_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let cfg: Self =
            serde_yaml::from_str(content).context("Failed to parse volume watcher config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overlay values found through `lookup` (normally the process environment).
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_STATE_QPS) {
            self.state_queries_per_second = v
                .parse()
                .with_context(|| format!("{ENV_STATE_QPS} is not a number: {v}"))?;
        }
        if let Some(v) = lookup(ENV_BATCH_MS) {
            self.update_batch_duration_ms = v
                .parse()
                .with_context(|| format!("{ENV_BATCH_MS} is not an integer: {v}"))?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.state_queries_per_second.is_finite() && self.state_queries_per_second > 0.0) {
            bail!(
                "state_queries_per_second must be positive, got {}",
                self.state_queries_per_second
            );
        }
        match Duration::try_from_secs_f64(1.0 / self.state_queries_per_second) {
            Ok(interval) if !interval.is_zero() => {}
            _ => bail!(
                "state_queries_per_second {} has no representable query interval",
                self.state_queries_per_second
            ),
        }
        if self.update_batch_duration_ms == 0 {
            bail!("update_batch_duration_ms must be non-zero");
        }
        if self.detach_attempts == 0 {
            bail!("detach_attempts must be at least 1");
        }
        if self.detach_timeout_ms == 0 {
            bail!("detach_timeout_ms must be non-zero");
        }
        if self.retry_backoff_base_ms > self.retry_backoff_max_ms {
            bail!(
                "retry_backoff_base_ms ({}) exceeds retry_backoff_max_ms ({})",
                self.retry_backoff_base_ms,
                self.retry_backoff_max_ms
            );
        }
        Ok(())
    }

    /// Spacing between discovery reads, never below one millisecond.
    pub fn state_query_interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.state_queries_per_second)
            .unwrap_or(Duration::from_secs(u64::from(u32::MAX)))
            .max(MIN_STATE_QUERY_INTERVAL)
    }

    pub fn update_batch_duration(&self) -> Duration {
        Duration::from_millis(self.update_batch_duration_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.detach_attempts,
            call_timeout: Duration::from_millis(self.detach_timeout_ms),
            backoff_base: Duration::from_millis(self.retry_backoff_base_ms),
            backoff_max: Duration::from_millis(self.retry_backoff_max_ms),
        }
    }
}
