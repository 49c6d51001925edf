//! Compensator
//!
//! Scales a candidate Deployment up and records its original replica count in
//! the compensation marker, as one conditional write. A unit that already
//! carries a marker is left alone, which makes redelivered triggers and
//! concurrent attempts on the same unit harmless: the loser of a write race
//! re-reads, sees the winner's marker, and stops.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::WorkloadStore;
use crate::config::CompensationConfig;
use crate::error::{Error, Result};
use crate::model::{UnitKey, UnitUpdate, WorkloadUnit};
use crate::retry::{with_retry_async, RetryConfig};
use crate::suppression::{DriftSuppressor, SuppressionOutcome};

/// What happened to one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationOutcome {
    /// Replicas raised and marker written by this call
    Compensated {
        original: i32,
        target: i32,
        suppression: SuppressionOutcome,
    },
    /// A marker was already present; nothing was scaled
    AlreadyCompensated {
        original: i32,
        suppression: SuppressionOutcome,
    },
    /// The unit already runs at or above the compensation target
    AtOrAboveTarget { replicas: i32 },
}

/// A unit the batch could not process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: String,
    pub cause: &'static str,
    pub message: String,
}

impl UnitFailure {
    pub fn new(unit: &UnitKey, err: &Error) -> Self {
        Self {
            unit: unit.to_string(),
            cause: err.cause(),
            message: err.to_string(),
        }
    }
}

/// Summary of one trigger's compensation batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompensationReport {
    pub node: String,
    pub compensated: Vec<String>,
    pub already_compensated: Vec<String>,
    pub unchanged: Vec<String>,
    /// Units scaled up whose pipeline could not be annotated
    pub suppression_missing: Vec<String>,
    pub failed: Vec<UnitFailure>,
}

/// Applies and records compensation for workload units
pub struct Compensator {
    store: Arc<dyn WorkloadStore>,
    suppressor: Option<DriftSuppressor>,
    policy: CompensationConfig,
    retry: RetryConfig,
}

impl Compensator {
    pub fn new(
        store: Arc<dyn WorkloadStore>,
        suppressor: Option<DriftSuppressor>,
        policy: CompensationConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            suppressor,
            policy,
            retry,
        }
    }

    /// Compensate every unit, never letting one unit's failure stop the rest
    pub async fn compensate_all(&self, node: &str, units: &[UnitKey]) -> CompensationReport {
        let mut report = CompensationReport {
            node: node.to_string(),
            ..CompensationReport::default()
        };

        for unit in units {
            match self.compensate(unit).await {
                Ok(CompensationOutcome::Compensated { suppression, .. }) => {
                    report.compensated.push(unit.to_string());
                    if !suppression.is_settled() {
                        report.suppression_missing.push(unit.to_string());
                    }
                }
                Ok(CompensationOutcome::AlreadyCompensated { suppression, .. }) => {
                    report.already_compensated.push(unit.to_string());
                    if !suppression.is_settled() {
                        report.suppression_missing.push(unit.to_string());
                    }
                }
                Ok(CompensationOutcome::AtOrAboveTarget { .. }) => {
                    report.unchanged.push(unit.to_string());
                }
                Err(e) => {
                    let failure = UnitFailure::new(unit, &e);
                    if matches!(e, Error::Configuration(_)) {
                        error!(
                            namespace = %unit.namespace,
                            deployment = %unit.name,
                            cause = failure.cause,
                            error = %e,
                            "Compensation abandoned: invalid marker or policy"
                        );
                    } else {
                        warn!(
                            namespace = %unit.namespace,
                            deployment = %unit.name,
                            cause = failure.cause,
                            error = %e,
                            "Compensation failed"
                        );
                    }
                    report.failed.push(failure);
                }
            }
        }

        info!(
            node = %report.node,
            compensated = report.compensated.len(),
            already_compensated = report.already_compensated.len(),
            unchanged = report.unchanged.len(),
            suppression_missing = report.suppression_missing.len(),
            failed = report.failed.len(),
            "Compensation batch complete"
        );
        report
    }

    /// Compensate one unit.
    ///
    /// Each round re-reads the unit; a conflicting write starts a new round,
    /// up to `retry.max_conflict_retries` rounds.
    #[instrument(skip(self, unit), fields(namespace = %unit.namespace, deployment = %unit.name))]
    pub async fn compensate(&self, unit: &UnitKey) -> Result<CompensationOutcome> {
        for attempt in 1..=self.retry.max_conflict_retries {
            let current = with_retry_async(&self.retry, "read deployment", || {
                self.store.get_unit(&unit.namespace, &unit.name)
            })
            .await?;

            if let Some(marker) = current.marker {
                info!(
                    original_replicas = marker.original_replicas,
                    compensated_at = %marker.set_at,
                    "Deployment already compensated, skipping scale-up"
                );
                let suppression = self.suppress(&current).await;
                return Ok(CompensationOutcome::AlreadyCompensated {
                    original: marker.original_replicas,
                    suppression,
                });
            }

            let Some(target) = self.policy.target.target_for(current.replicas) else {
                info!(
                    replicas = current.replicas,
                    "Deployment already at or above compensation target"
                );
                return Ok(CompensationOutcome::AtOrAboveTarget {
                    replicas: current.replicas,
                });
            };

            let update = UnitUpdate::compensate(&current, target);
            match with_retry_async(&self.retry, "compensate deployment", || {
                self.store.update_unit(&update)
            })
            .await
            {
                Ok(updated) => {
                    info!(
                        original_replicas = current.replicas,
                        replicas = updated.replicas,
                        "Increased deployment replicas"
                    );
                    let suppression = self.suppress(&updated).await;
                    return Ok(CompensationOutcome::Compensated {
                        original: current.replicas,
                        target,
                        suppression,
                    });
                }
                Err(e) if e.is_conflict() => {
                    debug!(attempt, "Deployment changed since read, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Conflict {
            kind: "Deployment",
            namespace: unit.namespace.clone(),
            name: unit.name.clone(),
        })
    }

    async fn suppress(&self, unit: &WorkloadUnit) -> SuppressionOutcome {
        match &self.suppressor {
            Some(suppressor) => {
                let outcome = suppressor.suppress(unit).await;
                if !outcome.is_settled() {
                    warn!(
                        namespace = %unit.namespace,
                        deployment = %unit.name,
                        suppression = %outcome,
                        "Deployment compensated without drift suppression"
                    );
                }
                outcome
            }
            None => SuppressionOutcome::Disabled,
        }
    }
}
