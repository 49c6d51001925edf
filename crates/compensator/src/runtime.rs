//! Task orchestration
//!
//! The event watcher and the restoration sweeper run as two independent tasks
//! sharing one cancellation token. Either task stopping, for whatever reason,
//! cancels the token so the other winds down too.

use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use k8s_openapi::api::core::v1::Event;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::cluster::{PipelineStore, WorkloadStore};
use crate::compensator::Compensator;
use crate::config::CompensatorConfig;
use crate::error::{Error, Result};
use crate::locator::WorkloadLocator;
use crate::suppression::DriftSuppressor;
use crate::sweeper::RestorationSweeper;
use crate::watcher::{EventWatcher, NodeTriggerHandler, WatchExit};

fn drift_suppressor(
    config: &CompensatorConfig,
    pipelines: Arc<dyn PipelineStore>,
) -> Option<DriftSuppressor> {
    config.suppression.enabled.then(|| {
        DriftSuppressor::new(
            pipelines,
            config.suppression.clone(),
            config.compensation.app_label.clone(),
            config.retry.clone(),
        )
    })
}

/// Reactive path: blocked node to compensated units
pub struct Context {
    locator: WorkloadLocator,
    compensator: Compensator,
}

impl Context {
    pub fn new(
        config: &CompensatorConfig,
        workloads: Arc<dyn WorkloadStore>,
        pipelines: Arc<dyn PipelineStore>,
    ) -> Self {
        Self {
            locator: WorkloadLocator::new(
                workloads.clone(),
                config.compensation.clone(),
                config.retry.clone(),
            ),
            compensator: Compensator::new(
                workloads,
                drift_suppressor(config, pipelines),
                config.compensation.clone(),
                config.retry.clone(),
            ),
        }
    }
}

#[async_trait]
impl NodeTriggerHandler for Context {
    async fn on_blocked_node(&self, node: &str) {
        let units = match self.locator.locate(node).await {
            Ok(units) => units,
            Err(e) => {
                warn!(
                    node = %node,
                    cause = e.cause(),
                    error = %e,
                    "Could not list pods on blocked node, waiting for redelivery"
                );
                return;
            }
        };
        if units.is_empty() {
            return;
        }

        let report = self.compensator.compensate_all(node, &units).await;
        if !report.failed.is_empty() {
            warn!(
                node = %node,
                failed = %serde_json::to_string(&report.failed).unwrap_or_default(),
                "Some deployments were not compensated"
            );
        }
    }
}

/// Build the sweeper for `config`
pub fn restoration_sweeper(
    config: &CompensatorConfig,
    workloads: Arc<dyn WorkloadStore>,
    pipelines: Arc<dyn PipelineStore>,
) -> RestorationSweeper {
    RestorationSweeper::new(
        workloads,
        drift_suppressor(config, pipelines),
        config.retry.clone(),
        config.sweep.interval(),
    )
}

/// Run the watcher and sweeper until `shutdown` is cancelled.
///
/// Returns an error if either task stops on its own, so the host restarts the
/// process.
#[instrument(skip_all)]
pub async fn run_compensator<S, E>(
    config: &CompensatorConfig,
    workloads: Arc<dyn WorkloadStore>,
    pipelines: Arc<dyn PipelineStore>,
    events: S,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Event, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let context = Arc::new(Context::new(config, workloads.clone(), pipelines.clone()));
    let sweeper = restoration_sweeper(config, workloads, pipelines);
    let watcher = EventWatcher::new(config.watch.reason.clone());

    info!(
        reason = %config.watch.reason,
        sweep_interval = ?config.sweep.interval(),
        suppression = config.suppression.enabled,
        "Starting event watcher and restoration sweeper"
    );

    let watch_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _stop_sweeper = shutdown.clone().drop_guard();
            watcher.run(events, context.as_ref(), shutdown).await
        }
    });

    let sweep_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _stop_watcher = shutdown.clone().drop_guard();
            sweeper.run(shutdown).await;
        }
    });

    let (watch_result, sweep_result) = tokio::join!(watch_handle, sweep_handle);

    if let Err(e) = sweep_result {
        error!(error = %e, "Restoration sweeper task failed");
        return Err(Error::TaskStopped("restoration sweeper".to_string()));
    }

    match watch_result {
        Ok(WatchExit::Shutdown) => {
            info!("Compensator stopped");
            Ok(())
        }
        Ok(WatchExit::StreamEnded) => Err(Error::TaskStopped("event watcher".to_string())),
        Err(e) => {
            error!(error = %e, "Event watcher task failed");
            Err(Error::TaskStopped("event watcher".to_string()))
        }
    }
}
