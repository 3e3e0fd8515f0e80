//! scaler.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::types::roles;

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("executor.max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("executor.concurrency_ceiling must be at least 1")]
    ZeroCeiling,

    #[error("executor.max_backoff_ms ({max}) is below initial_backoff_ms ({initial})")]
    BackoffRange { initial: u64, max: u64 },

    #[error("executor.backoff_multiplier must be >= 1.0, got {0}")]
    Multiplier(String),

    #[error("executor.readiness_timeout_secs must be at least 1")]
    ZeroReadinessTimeout,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    pub executor: ExecutorConfig,
    pub reconciler: ReconcilerConfig,
    /// Per-role availability floors. Roles not listed fall back to
    /// [`AvailabilityPolicy::default_for`].
    pub availability: BTreeMap<String, AvailabilityPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Attempts per cluster call before a transient error becomes terminal.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// How long a created pod may take to report ready.
    pub readiness_timeout_secs: u64,
    pub readiness_poll_ms: u64,
    /// Operations run concurrently within a batch. 0 means "batch size".
    pub concurrency: usize,
    /// Upper bound on concurrency regardless of batch size.
    pub concurrency_ceiling: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            readiness_timeout_secs: 300,
            readiness_poll_ms: 1_000,
            concurrency: 0,
            concurrency_ceiling: 16,
        }
    }
}

impl ExecutorConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }

    /// Worker-pool size for a batch of `batch_len` operations.
    pub fn concurrency_for(&self, batch_len: usize) -> usize {
        let wanted = if self.concurrency == 0 {
            batch_len
        } else {
            self.concurrency
        };
        wanted.clamp(1, self.concurrency_ceiling.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Seconds between controller passes.
    pub interval_secs: u64,
    /// Port appended to PS host identifiers.
    pub ps_port: u16,
    /// Replace failed operations synthesized from replica specs.
    pub substitute_failed: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            ps_port: 2222,
            substitute_failed: true,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Minimum number of ready pods a role must keep while a plan runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum AvailabilityPolicy {
    /// All but one of the currently ready pods.
    AllButOne,
    /// A fixed minimum.
    Min { count: u32 },
    /// No floor; removals are unconstrained.
    None,
}

impl AvailabilityPolicy {
    /// Parameter servers keep all-but-one online; other roles are free.
    pub fn default_for(role: &str) -> Self {
        if role == roles::PS {
            Self::AllButOne
        } else {
            Self::None
        }
    }

    /// Floor given `ready` pods, or `None` when the role is unconstrained.
    pub fn floor(&self, ready: u32) -> Option<u32> {
        match self {
            Self::AllButOne => Some(ready.saturating_sub(1)),
            Self::Min { count } => Some(*count),
            Self::None => None,
        }
    }
}

impl ScalerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ScalerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Policy in force for `role`.
    pub fn policy_for(&self, role: &str) -> AvailabilityPolicy {
        self.availability
            .get(role)
            .copied()
            .unwrap_or_else(|| AvailabilityPolicy::default_for(role))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let exec = &self.executor;
        if exec.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if exec.concurrency_ceiling == 0 {
            return Err(ConfigError::ZeroCeiling);
        }
        if exec.max_backoff_ms < exec.initial_backoff_ms {
            return Err(ConfigError::BackoffRange {
                initial: exec.initial_backoff_ms,
                max: exec.max_backoff_ms,
            });
        }
        if !(exec.backoff_multiplier >= 1.0) {
            return Err(ConfigError::Multiplier(exec.backoff_multiplier.to_string()));
        }
        if exec.readiness_timeout_secs == 0 {
            return Err(ConfigError::ZeroReadinessTimeout);
        }
        Ok(())
    }
}
