//! Drift suppression on the delivery pipeline.
//!
//! While a unit is compensated its Argo CD Application carries an annotation
//! telling Argo CD not to revert the replica change. Both directions are
//! best-effort: the outcome is reported, never propagated as an error.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cluster::PipelineStore;
use crate::config::SuppressionConfig;
use crate::error::Error;
use crate::model::{PipelineRef, WorkloadUnit};
use crate::retry::{with_retry_async, RetryConfig};

/// Result of adding or removing the suppression annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuppressionOutcome {
    /// Suppression is switched off in configuration
    Disabled,
    /// Annotation written (or removed) on the named pipeline
    Applied { pipeline: String },
    /// Pipeline already in the desired state
    Unchanged { pipeline: String },
    /// No pipeline deploys this unit's app
    NoPipeline,
    /// Lookup or write failed
    Failed { cause: &'static str, message: String },
}

impl SuppressionOutcome {
    fn failed(err: &Error) -> Self {
        SuppressionOutcome::Failed {
            cause: err.cause(),
            message: err.to_string(),
        }
    }

    /// `true` if the pipeline is known to be in the desired state
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            SuppressionOutcome::Disabled
                | SuppressionOutcome::Applied { .. }
                | SuppressionOutcome::Unchanged { .. }
        )
    }
}

impl fmt::Display for SuppressionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuppressionOutcome::Disabled => write!(f, "disabled"),
            SuppressionOutcome::Applied { pipeline } => write!(f, "applied to {pipeline}"),
            SuppressionOutcome::Unchanged { pipeline } => write!(f, "unchanged on {pipeline}"),
            SuppressionOutcome::NoPipeline => write!(f, "no pipeline found"),
            SuppressionOutcome::Failed { cause, message } => write!(f, "failed ({cause}): {message}"),
        }
    }
}

/// Adds and removes the drift-suppression annotation
pub struct DriftSuppressor {
    pipelines: Arc<dyn PipelineStore>,
    config: SuppressionConfig,
    app_label: String,
    retry: RetryConfig,
}

impl DriftSuppressor {
    pub fn new(
        pipelines: Arc<dyn PipelineStore>,
        config: SuppressionConfig,
        app_label: impl Into<String>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            pipelines,
            config,
            app_label: app_label.into(),
            retry,
        }
    }

    /// Application id for `unit`: its app selector label, else its name
    pub fn app_id(&self, unit: &WorkloadUnit) -> String {
        unit.selector_labels
            .get(&self.app_label)
            .cloned()
            .unwrap_or_else(|| unit.name.clone())
    }

    fn pipeline_namespace<'a>(&'a self, unit: &'a WorkloadUnit) -> &'a str {
        self.config
            .pipeline_namespace
            .as_deref()
            .unwrap_or(&unit.namespace)
    }

    /// Mark the unit's pipeline so drift correction leaves it alone
    pub async fn suppress(&self, unit: &WorkloadUnit) -> SuppressionOutcome {
        if !self.config.enabled {
            return SuppressionOutcome::Disabled;
        }
        let value = self.config.annotation_value.clone();
        self.converge(unit, |pipeline| {
            match pipeline.annotations.get(&self.config.annotation_key) {
                Some(current) if *current == value => None,
                Some(current) => {
                    warn!(
                        pipeline = %pipeline.key(),
                        annotation = %self.config.annotation_key,
                        previous = %current,
                        "Replacing existing annotation value"
                    );
                    Some(Some(value.clone()))
                }
                None => Some(Some(value.clone())),
            }
        })
        .await
    }

    /// Remove the annotation if it still carries the value we wrote
    pub async fn release(&self, unit: &WorkloadUnit) -> SuppressionOutcome {
        if !self.config.enabled {
            return SuppressionOutcome::Disabled;
        }
        self.converge(unit, |pipeline| {
            match pipeline.annotations.get(&self.config.annotation_key) {
                Some(current) if *current == self.config.annotation_value => Some(None),
                _ => None,
            }
        })
        .await
    }

    /// Read-modify-write loop shared by both directions.
    ///
    /// `desired` returns `None` when the pipeline needs no change, otherwise
    /// the annotation value to write (`Some(None)` removes it).
    async fn converge<F>(&self, unit: &WorkloadUnit, desired: F) -> SuppressionOutcome
    where
        F: Fn(&PipelineRef) -> Option<Option<String>>,
    {
        let namespace = self.pipeline_namespace(unit);
        let app_id = self.app_id(unit);
        let key = &self.config.annotation_key;

        for attempt in 1..=self.retry.max_conflict_retries {
            let found = with_retry_async(&self.retry, "find pipeline", || {
                self.pipelines
                    .find_pipeline_for_app(namespace, &app_id, &self.config.pipeline_app_label)
            })
            .await;

            let pipeline = match found {
                Ok(Some(pipeline)) => pipeline,
                Ok(None) => {
                    warn!(
                        namespace = %namespace,
                        app = %app_id,
                        "No pipeline found for app, drift suppression not changed"
                    );
                    return SuppressionOutcome::NoPipeline;
                }
                Err(e) => {
                    warn!(namespace = %namespace, app = %app_id, error = %e, "Pipeline lookup failed");
                    return SuppressionOutcome::failed(&e);
                }
            };

            let Some(value) = desired(&pipeline) else {
                debug!(pipeline = %pipeline.key(), "Pipeline already in desired state");
                return SuppressionOutcome::Unchanged {
                    pipeline: pipeline.key(),
                };
            };

            let written = with_retry_async(&self.retry, "annotate pipeline", || {
                self.pipelines.annotate(&pipeline, key, value.as_deref())
            })
            .await;

            match written {
                Ok(updated) => {
                    info!(
                        pipeline = %updated.key(),
                        annotation = %key,
                        value = value.as_deref().unwrap_or("<removed>"),
                        "Updated drift suppression"
                    );
                    return SuppressionOutcome::Applied {
                        pipeline: updated.key(),
                    };
                }
                Err(e) if e.is_conflict() => {
                    debug!(pipeline = %pipeline.key(), attempt, "Pipeline changed, retrying");
                }
                Err(e) => {
                    warn!(pipeline = %pipeline.key(), error = %e, "Failed to update pipeline");
                    return SuppressionOutcome::failed(&e);
                }
            }
        }

        let err = Error::Conflict {
            kind: "Application",
            namespace: namespace.to_string(),
            name: app_id,
        };
        warn!(error = %err, "Conflict retries exhausted updating pipeline");
        SuppressionOutcome::failed(&err)
    }
}
