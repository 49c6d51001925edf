//! Compensator Configuration
//!
//! Operator-facing policy for the compensator, loaded from a mounted YAML file.
//! Every section has defaults so an empty file (or no file) yields the policy
//! the service historically ran with.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryConfig;

/// Default location of the mounted configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Main compensator configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CompensatorConfig {
    /// Which workloads are compensated and by how much
    pub compensation: CompensationConfig,

    /// Drift suppression on the delivery pipeline (Argo CD Application)
    pub suppression: SuppressionConfig,

    /// Restoration sweep schedule
    pub sweep: SweepConfig,

    /// Backoff and conflict retry budget for cluster calls
    pub retry: RetryConfig,

    /// Event stream filter
    pub watch: WatchConfig,

    /// Health endpoint
    pub server: ServerConfig,
}

/// Compensation policy
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompensationConfig {
    /// Values of the type label that make a pod eligible for compensation
    pub eligible_types: BTreeSet<String>,

    /// Pod label naming the application (also the deployment selector key)
    pub app_label: String,

    /// Pod label naming the workload type
    pub type_label: String,

    /// Replica count applied while compensating
    pub target: ReplicaTarget,
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            eligible_types: BTreeSet::from(["test".to_string()]),
            app_label: "app".to_string(),
            type_label: "type".to_string(),
            target: ReplicaTarget::default(),
        }
    }
}

impl CompensationConfig {
    /// Returns `true` if a pod with this type label value may be compensated
    pub fn is_eligible_type(&self, workload_type: &str) -> bool {
        self.eligible_types.contains(workload_type)
    }
}

/// How the compensated replica count is derived from the current one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum ReplicaTarget {
    /// Scale to a fixed replica count
    Fixed { replicas: i32 },
    /// Scale to the current replica count plus `by`
    Increment { by: i32 },
}

impl Default for ReplicaTarget {
    fn default() -> Self {
        ReplicaTarget::Fixed { replicas: 2 }
    }
}

impl ReplicaTarget {
    /// Compute the compensated replica count for a unit currently at `current`.
    ///
    /// Returns `None` when the result would not raise the count.
    pub fn target_for(&self, current: i32) -> Option<i32> {
        let target = match *self {
            ReplicaTarget::Fixed { replicas } => replicas,
            ReplicaTarget::Increment { by } => current.saturating_add(by),
        };
        (target > current).then_some(target)
    }
}

/// Drift suppression settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SuppressionConfig {
    /// Annotate the pipeline while a unit is compensated
    pub enabled: bool,

    /// Annotation key written on the pipeline
    pub annotation_key: String,

    /// Annotation value written on the pipeline
    pub annotation_value: String,

    /// Namespace holding the pipelines; defaults to the unit's namespace
    pub pipeline_namespace: Option<String>,

    /// Label on the pipeline carrying the application id
    pub pipeline_app_label: String,
}

impl Default for SuppressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            annotation_key: "argocd.argoproj.io/sync-options".to_string(),
            annotation_value: "IgnoreExtraneous".to_string(),
            pipeline_namespace: None,
            pipeline_app_label: "app".to_string(),
        }
    }
}

/// Restoration sweep settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SweepConfig {
    /// Seconds between sweep ticks
    pub interval_seconds: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 300,
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Event filter settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WatchConfig {
    /// Event reason signalling a blocked voluntary disruption
    pub reason: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            reason: "DisruptionBlocked".to_string(),
        }
    }
}

/// Health server settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl CompensatorConfig {
    /// Load configuration from a mounted YAML file
    pub fn from_mounted_file(config_path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(config_path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    /// Validate that the configuration describes a usable policy
    pub fn validate(&self) -> Result<()> {
        if self.compensation.eligible_types.is_empty() {
            return Err(Error::Configuration(
                "compensation.eligibleTypes must name at least one type".to_string(),
            ));
        }
        if self.compensation.app_label.trim().is_empty() {
            return Err(Error::Configuration(
                "compensation.appLabel must not be empty".to_string(),
            ));
        }
        match self.compensation.target {
            ReplicaTarget::Fixed { replicas } if replicas < 1 => {
                return Err(Error::Configuration(format!(
                    "compensation.target.replicas must be positive, got {replicas}"
                )));
            }
            ReplicaTarget::Increment { by } if by < 1 => {
                return Err(Error::Configuration(format!(
                    "compensation.target.by must be positive, got {by}"
                )));
            }
            _ => {}
        }
        if self.suppression.enabled && self.suppression.annotation_key.trim().is_empty() {
            return Err(Error::Configuration(
                "suppression.annotationKey must not be empty when suppression is enabled"
                    .to_string(),
            ));
        }
        if self.sweep.interval_seconds == 0 {
            return Err(Error::Configuration(
                "sweep.intervalSeconds must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 || self.retry.max_conflict_retries == 0 {
            return Err(Error::Configuration(
                "retry.maxAttempts and retry.maxConflictRetries must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Configuration(format!(
                "retry.backoffMultiplier must be >= 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        if self.watch.reason.trim().is_empty() {
            return Err(Error::Configuration(
                "watch.reason must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
