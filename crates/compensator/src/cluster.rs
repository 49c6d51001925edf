//! Cluster interfaces consumed by the locator, compensator and sweeper.
//!
//! Components receive these as `Arc<dyn ...>` through their constructors; the
//! kube-rs implementations live in [`crate::kube_store`].

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{PipelineRef, PodInfo, UnitKey, UnitUpdate, WorkloadUnit};

/// Read/write access to workloads
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    /// Pods currently scheduled on `node`, across all namespaces
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<PodInfo>>;

    /// Units in `namespace` whose labels match `key=value`
    async fn find_units_by_selector(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<Vec<UnitKey>>;

    /// Fresh read of one unit
    async fn get_unit(&self, namespace: &str, name: &str) -> Result<WorkloadUnit>;

    /// Every unit carrying the marker label or the original-replicas
    /// annotation, across all namespaces.
    ///
    /// Only identities are returned; callers re-read each unit before acting.
    async fn list_units_with_marker(&self) -> Result<Vec<UnitKey>>;

    /// Apply `update` if the unit still has `update.expected_version`.
    ///
    /// Fails with [`crate::Error::Conflict`] otherwise.
    async fn update_unit(&self, update: &UnitUpdate) -> Result<WorkloadUnit>;
}

/// Access to delivery pipelines, limited to annotation changes
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Pipeline deploying `app_id`, if any (see [`crate::model::select_pipeline`])
    async fn find_pipeline_for_app(
        &self,
        namespace: &str,
        app_id: &str,
        app_label: &str,
    ) -> Result<Option<PipelineRef>>;

    /// Set (`Some`) or remove (`None`) one annotation, conditioned on
    /// `pipeline.resource_version`.
    async fn annotate(
        &self,
        pipeline: &PipelineRef,
        key: &str,
        value: Option<&str>,
    ) -> Result<PipelineRef>;
}
