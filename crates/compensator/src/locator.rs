//! Workload Locator
//!
//! Maps a blocked node to the Deployments that should be compensated: pods on
//! the node are filtered by the eligible type policy, grouped by namespace and
//! app label, and each group resolved to one Deployment by label selector.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::cluster::WorkloadStore;
use crate::config::CompensationConfig;
use crate::error::Result;
use crate::model::{PodInfo, UnitKey};
use crate::retry::{with_retry_async, RetryConfig};

/// A group of eligible pods sharing a namespace and app label value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CandidateGroup {
    pub namespace: String,
    pub app: String,
}

/// Group the eligible pods, ordered by namespace then app
pub fn candidate_groups(
    pods: &[PodInfo],
    policy: &CompensationConfig,
) -> BTreeMap<CandidateGroup, usize> {
    let mut groups = BTreeMap::new();

    for pod in pods {
        let app = pod
            .labels
            .get(&policy.app_label)
            .map(String::as_str)
            .unwrap_or_default();
        let workload_type = pod
            .labels
            .get(&policy.type_label)
            .map(String::as_str)
            .unwrap_or_default();

        debug!(
            pod = %pod.name,
            namespace = %pod.namespace,
            app = %app,
            workload_type = %workload_type,
            "Inspecting pod"
        );

        if app.is_empty() || !policy.is_eligible_type(workload_type) {
            continue;
        }

        *groups
            .entry(CandidateGroup {
                namespace: pod.namespace.clone(),
                app: app.to_string(),
            })
            .or_insert(0) += 1;
    }

    groups
}

/// Resolves blocked nodes to candidate units
pub struct WorkloadLocator {
    store: Arc<dyn WorkloadStore>,
    policy: CompensationConfig,
    retry: RetryConfig,
}

impl WorkloadLocator {
    pub fn new(store: Arc<dyn WorkloadStore>, policy: CompensationConfig, retry: RetryConfig) -> Self {
        Self {
            store,
            policy,
            retry,
        }
    }

    /// Units to compensate for pods on `node`.
    ///
    /// Only a failure to list the node's pods is returned as an error; groups
    /// that cannot be resolved are logged and skipped.
    #[instrument(skip(self))]
    pub async fn locate(&self, node: &str) -> Result<Vec<UnitKey>> {
        if node.is_empty() {
            warn!("Ignoring trigger with empty node name");
            return Ok(Vec::new());
        }

        let pods = with_retry_async(&self.retry, "list pods on node", || {
            self.store.list_pods_on_node(node)
        })
        .await?;

        if pods.is_empty() {
            info!(node = %node, "No pods scheduled on node, nothing to compensate");
            return Ok(Vec::new());
        }

        let groups = candidate_groups(&pods, &self.policy);
        info!(
            node = %node,
            pods = pods.len(),
            groups = groups.len(),
            "Found compensation candidates"
        );

        let mut units = Vec::with_capacity(groups.len());
        for (group, pod_count) in groups {
            match self.resolve(&group).await {
                Ok(Some(unit)) => {
                    debug!(unit = %unit, pods = pod_count, "Resolved candidate group");
                    units.push(unit);
                }
                Ok(None) => {
                    warn!(
                        namespace = %group.namespace,
                        app = %group.app,
                        "No deployment matches app label, skipping"
                    );
                }
                Err(e) => {
                    warn!(
                        namespace = %group.namespace,
                        app = %group.app,
                        cause = e.cause(),
                        error = %e,
                        "Failed to resolve deployment, skipping"
                    );
                }
            }
        }

        Ok(units)
    }

    /// Resolve one group to a Deployment.
    ///
    /// Several matches resolve to the lexicographically smallest name so every
    /// redelivery of the same trigger picks the same unit.
    async fn resolve(&self, group: &CandidateGroup) -> Result<Option<UnitKey>> {
        let matches = with_retry_async(&self.retry, "find deployments by selector", || {
            self.store
                .find_units_by_selector(&group.namespace, &self.policy.app_label, &group.app)
        })
        .await?;

        if matches.len() > 1 {
            warn!(
                namespace = %group.namespace,
                app = %group.app,
                matches = matches.len(),
                "Multiple deployments match app label, choosing smallest name"
            );
        }

        Ok(matches.into_iter().min())
    }
}
