//! Restoration Sweeper
//!
//! Runs on a fixed interval, independent of the event stream. Every tick it
//! lists Deployments carrying a compensation marker, releases drift
//! suppression on the pipeline, then scales each back to the recorded original
//! count and removes the marker in one conditional write.
//! Units that cannot be restored keep their marker and are retried on the
//! next tick, so a missed event or a restart never strands a scaled-up unit.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::WorkloadStore;
use crate::compensator::UnitFailure;
use crate::error::{Error, Result};
use crate::model::{UnitKey, UnitState, UnitUpdate};
use crate::retry::{with_retry_async, RetryConfig};
use crate::suppression::{DriftSuppressor, SuppressionOutcome};

/// What happened to one marked unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Replicas scaled back and marker removed
    Restored { from: i32, to: i32 },
    /// Replicas already matched the original count; only the marker was removed
    MarkerCleared { replicas: i32 },
    /// Marker was gone by the time the unit was re-read
    NotCompensated,
    /// Pipeline still suppressed; unit left `Compensated` for the next tick
    SuppressionPending,
}

/// Report from a sweep tick.
#[derive(Debug, Clone)]
pub struct SweepReport {
    /// When the sweep ran.
    pub run_time: DateTime<Utc>,
    /// Units found carrying a marker.
    pub marked: usize,
    /// Units scaled back to their original count.
    pub restored: Vec<String>,
    /// Units whose marker was cleared without a scale change.
    pub cleared: Vec<String>,
    /// Units left `Compensated` for the next tick.
    pub pending: Vec<UnitFailure>,
    /// Units left `Compensated` because their pipeline could not be released.
    pub suppression_pending: Vec<String>,
}

impl SweepReport {
    fn new(marked: usize) -> Self {
        Self {
            run_time: Utc::now(),
            marked,
            restored: Vec::new(),
            cleared: Vec::new(),
            pending: Vec::new(),
            suppression_pending: Vec::new(),
        }
    }
}

/// Periodically restores compensated units
pub struct RestorationSweeper {
    store: Arc<dyn WorkloadStore>,
    suppressor: Option<DriftSuppressor>,
    retry: RetryConfig,
    interval: Duration,
}

impl RestorationSweeper {
    pub fn new(
        store: Arc<dyn WorkloadStore>,
        suppressor: Option<DriftSuppressor>,
        retry: RetryConfig,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            suppressor,
            retry,
            interval,
        }
    }

    /// Tick until `shutdown` is cancelled. The first sweep runs immediately.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "Starting restoration sweeper");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Restoration sweeper shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.sweep().await {
                warn!(
                    cause = e.cause(),
                    error = %e,
                    "Sweep failed to list compensated deployments, retrying next tick"
                );
            }
        }
    }

    /// One full pass over every marked unit
    pub async fn sweep(&self) -> Result<SweepReport> {
        let marked = with_retry_async(&self.retry, "list compensated deployments", || {
            self.store.list_units_with_marker()
        })
        .await?;

        let mut report = SweepReport::new(marked.len());
        if marked.is_empty() {
            debug!("No compensated deployments");
            return Ok(report);
        }

        for unit in &marked {
            match self.restore(unit).await {
                Ok(RestoreOutcome::Restored { .. }) => report.restored.push(unit.to_string()),
                Ok(RestoreOutcome::MarkerCleared { .. }) => report.cleared.push(unit.to_string()),
                Ok(RestoreOutcome::SuppressionPending) => {
                    report.suppression_pending.push(unit.to_string());
                }
                Ok(RestoreOutcome::NotCompensated) => {}
                Err(e) => {
                    let failure = UnitFailure::new(unit, &e);
                    if matches!(e, Error::Configuration(_)) {
                        error!(
                            namespace = %unit.namespace,
                            deployment = %unit.name,
                            state = %UnitState::Compensated,
                            cause = failure.cause,
                            error = %e,
                            "Cannot restore deployment: marker is malformed"
                        );
                    } else {
                        warn!(
                            namespace = %unit.namespace,
                            deployment = %unit.name,
                            state = %UnitState::Compensated,
                            cause = failure.cause,
                            error = %e,
                            "Restoration failed, will retry next tick"
                        );
                    }
                    report.pending.push(failure);
                }
            }
        }

        info!(
            marked = report.marked,
            restored = report.restored.len(),
            cleared = report.cleared.len(),
            pending = report.pending.len(),
            suppression_pending = report.suppression_pending.len(),
            "Sweep complete"
        );
        Ok(report)
    }

    /// Release drift suppression, then restore one unit.
    ///
    /// The pipeline is released before the marker is cleared so a failed
    /// release leaves the unit marked and the next tick tries again.
    #[instrument(skip(self, unit), fields(namespace = %unit.namespace, deployment = %unit.name))]
    pub async fn restore(&self, unit: &UnitKey) -> Result<RestoreOutcome> {
        let mut released = false;

        for attempt in 1..=self.retry.max_conflict_retries {
            let current = with_retry_async(&self.retry, "read deployment", || {
                self.store.get_unit(&unit.namespace, &unit.name)
            })
            .await?;

            let Some(marker) = current.marker else {
                debug!("Marker already removed");
                return Ok(RestoreOutcome::NotCompensated);
            };

            if !released {
                if let Some(suppressor) = &self.suppressor {
                    let outcome = suppressor.release(&current).await;
                    if matches!(outcome, SuppressionOutcome::Failed { .. }) {
                        warn!(
                            state = %UnitState::Compensated,
                            suppression = %outcome,
                            "Drift suppression not released, keeping deployment compensated"
                        );
                        return Ok(RestoreOutcome::SuppressionPending);
                    }
                }
                released = true;
            }

            let update = UnitUpdate::restore(&current, marker.original_replicas);
            debug!(
                state = %UnitState::Restoring,
                replicas = current.replicas,
                original_replicas = marker.original_replicas,
                attempt,
                "Restoring deployment"
            );

            match with_retry_async(&self.retry, "restore deployment", || {
                self.store.update_unit(&update)
            })
            .await
            {
                Ok(updated) if update.replicas.is_some() => {
                    info!(
                        state = %UnitState::Normal,
                        from = current.replicas,
                        to = updated.replicas,
                        compensated_at = %marker.set_at,
                        "Restored deployment replicas"
                    );
                    return Ok(RestoreOutcome::Restored {
                        from: current.replicas,
                        to: updated.replicas,
                    });
                }
                Ok(updated) => {
                    info!(
                        state = %UnitState::Normal,
                        replicas = updated.replicas,
                        "Replicas already at original count, cleared marker"
                    );
                    return Ok(RestoreOutcome::MarkerCleared {
                        replicas: updated.replicas,
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
}
