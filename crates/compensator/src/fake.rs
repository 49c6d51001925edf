//! In-memory cluster used by unit tests.
//!
//! Mirrors the API server behaviour the compensator relies on: every write
//! bumps the resource version, and a write carrying a stale version fails
//! with a conflict. Markers are stored as raw labels and annotations and
//! decoded with the same code the kube adapter uses.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::cluster::{PipelineStore, WorkloadStore};
use crate::error::{Error, Result};
use crate::model::{
    select_pipeline, CompensationMarker, MarkerChange, PipelineRef, PodInfo, UnitKey, UnitUpdate,
    WorkloadUnit, COMPENSATED_AT_ANNOTATION, MARKER_LABEL, ORIGINAL_REPLICAS_ANNOTATION,
};

#[derive(Debug, Clone)]
struct FakeDeployment {
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    replicas: i32,
    version: u64,
}

#[derive(Default)]
struct State {
    deployments: BTreeMap<UnitKey, FakeDeployment>,
    pods: BTreeMap<String, Vec<PodInfo>>,
    pipelines: BTreeMap<(String, String), (PipelineRef, u64)>,
    next_version: u64,
    unit_conflicts: u32,
    pipeline_conflicts: u32,
    transient_reads: u32,
    unit_writes: u32,
    scale_changes: Vec<(UnitKey, i32)>,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_deployment(&self, namespace: &str, name: &str, app: &str, replicas: i32) {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        state.deployments.insert(
            UnitKey::new(namespace, name),
            FakeDeployment {
                labels: BTreeMap::from([("app".to_string(), app.to_string())]),
                annotations: BTreeMap::new(),
                replicas,
                version,
            },
        );
    }

    pub fn add_pod(&self, node: &str, pod: PodInfo) {
        self.state
            .lock()
            .unwrap()
            .pods
            .entry(node.to_string())
            .or_default()
            .push(pod);
    }

    pub fn add_pipeline(&self, namespace: &str, name: &str, app: &str) {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        state.pipelines.insert(
            (namespace.to_string(), name.to_string()),
            (
                PipelineRef {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    resource_version: None,
                    labels: BTreeMap::from([("app".to_string(), app.to_string())]),
                    annotations: BTreeMap::new(),
                },
                version,
            ),
        );
    }

    /// Out-of-band replica change, as another actor would make
    pub fn set_replicas(&self, namespace: &str, name: &str, replicas: i32) {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        let deployment = state
            .deployments
            .get_mut(&UnitKey::new(namespace, name))
            .unwrap();
        deployment.replicas = replicas;
        deployment.version = version;
    }

    /// Overwrite the raw marker annotation, bypassing validation
    pub fn set_raw_marker(&self, namespace: &str, name: &str, original_replicas: &str) {
        let mut state = self.state.lock().unwrap();
        let deployment = state
            .deployments
            .get_mut(&UnitKey::new(namespace, name))
            .unwrap();
        deployment
            .labels
            .insert(MARKER_LABEL.to_string(), "true".to_string());
        deployment.annotations.insert(
            ORIGINAL_REPLICAS_ANNOTATION.to_string(),
            original_replicas.to_string(),
        );
    }

    /// Drop the marker label but keep its annotations, as a GitOps sync would
    pub fn remove_marker_label(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        let deployment = state
            .deployments
            .get_mut(&UnitKey::new(namespace, name))
            .unwrap();
        deployment.labels.remove(MARKER_LABEL);
        deployment.version = version;
    }

    /// The next `n` unit writes lose a race to a concurrent writer
    pub fn inject_unit_conflicts(&self, n: u32) {
        self.state.lock().unwrap().unit_conflicts = n;
    }

    /// The next `n` pipeline writes lose a race to a concurrent writer
    pub fn inject_pipeline_conflicts(&self, n: u32) {
        self.state.lock().unwrap().pipeline_conflicts = n;
    }

    /// The next `n` unit reads fail with a transient error
    pub fn inject_transient_reads(&self, n: u32) {
        self.state.lock().unwrap().transient_reads = n;
    }

    pub fn unit(&self, namespace: &str, name: &str) -> WorkloadUnit {
        let state = self.state.lock().unwrap();
        let key = UnitKey::new(namespace, name);
        to_unit(&key, &state.deployments[&key]).unwrap()
    }

    pub fn pipeline_annotations(&self, namespace: &str, name: &str) -> BTreeMap<String, String> {
        self.state.lock().unwrap().pipelines[&(namespace.to_string(), name.to_string())]
            .0
            .annotations
            .clone()
    }

    /// Successful unit writes
    pub fn unit_writes(&self) -> u32 {
        self.state.lock().unwrap().unit_writes
    }

    /// Replica values written through `update_unit`, in order
    pub fn scale_changes(&self) -> Vec<(UnitKey, i32)> {
        self.state.lock().unwrap().scale_changes.clone()
    }
}

fn to_unit(key: &UnitKey, deployment: &FakeDeployment) -> Result<WorkloadUnit> {
    Ok(WorkloadUnit {
        namespace: key.namespace.clone(),
        name: key.name.clone(),
        selector_labels: deployment.labels.clone(),
        replicas: deployment.replicas,
        resource_version: Some(deployment.version.to_string()),
        marker: CompensationMarker::from_metadata(&deployment.labels, &deployment.annotations)?,
    })
}

fn not_found(kind: &'static str, namespace: &str, name: &str) -> Error {
    Error::NotFound {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

#[async_trait]
impl WorkloadStore for FakeCluster {
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<PodInfo>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .get(node)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_units_by_selector(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<Vec<UnitKey>> {
        let state = self.state.lock().unwrap();
        // Reverse order so callers cannot rely on list order.
        Ok(state
            .deployments
            .iter()
            .rev()
            .filter(|(k, d)| {
                k.namespace == namespace && d.labels.get(key).is_some_and(|v| v == value)
            })
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn get_unit(&self, namespace: &str, name: &str) -> Result<WorkloadUnit> {
        let unit = {
            let mut state = self.state.lock().unwrap();
            if state.transient_reads > 0 {
                state.transient_reads -= 1;
                return Err(Error::TransientInfra("connection reset".to_string()));
            }
            let key = UnitKey::new(namespace, name);
            let deployment = state
                .deployments
                .get(&key)
                .ok_or_else(|| not_found("Deployment", namespace, name))?;
            to_unit(&key, deployment)?
        };
        // Let concurrent callers interleave between read and write.
        tokio::task::yield_now().await;
        Ok(unit)
    }

    async fn list_units_with_marker(&self) -> Result<Vec<UnitKey>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .deployments
            .iter()
            .filter(|(_, d)| {
                d.labels.contains_key(MARKER_LABEL)
                    || d.annotations.contains_key(ORIGINAL_REPLICAS_ANNOTATION)
            })
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn update_unit(&self, update: &UnitUpdate) -> Result<WorkloadUnit> {
        let mut state = self.state.lock().unwrap();
        let key = UnitKey::new(&update.namespace, &update.name);

        if state.unit_conflicts > 0 {
            state.unit_conflicts -= 1;
            let version = state.bump();
            if let Some(deployment) = state.deployments.get_mut(&key) {
                deployment.version = version;
            }
        }

        let version = state.bump();
        let Some(deployment) = state.deployments.get_mut(&key) else {
            return Err(not_found("Deployment", &update.namespace, &update.name));
        };
        if let Some(expected) = &update.expected_version {
            if *expected != deployment.version.to_string() {
                return Err(Error::Conflict {
                    kind: "Deployment",
                    namespace: update.namespace.clone(),
                    name: update.name.clone(),
                });
            }
        }

        match update.marker {
            MarkerChange::Set(marker) => {
                deployment
                    .labels
                    .insert(MARKER_LABEL.to_string(), "true".to_string());
                deployment.annotations.extend(marker.to_annotations());
            }
            MarkerChange::Clear => {
                deployment.labels.remove(MARKER_LABEL);
                deployment.annotations.remove(ORIGINAL_REPLICAS_ANNOTATION);
                deployment.annotations.remove(COMPENSATED_AT_ANNOTATION);
            }
        }
        if let Some(replicas) = update.replicas {
            deployment.replicas = replicas;
        }
        deployment.version = version;

        let unit = to_unit(&key, deployment)?;
        state.unit_writes += 1;
        if let Some(replicas) = update.replicas {
            state.scale_changes.push((key, replicas));
        }
        Ok(unit)
    }
}

#[async_trait]
impl PipelineStore for FakeCluster {
    async fn find_pipeline_for_app(
        &self,
        namespace: &str,
        app_id: &str,
        app_label: &str,
    ) -> Result<Option<PipelineRef>> {
        let state = self.state.lock().unwrap();
        let candidates = state
            .pipelines
            .values()
            .filter(|(p, _)| p.namespace == namespace)
            .map(|(p, version)| PipelineRef {
                resource_version: Some(version.to_string()),
                ..p.clone()
            })
            .collect();
        Ok(select_pipeline(candidates, app_id, app_label))
    }

    async fn annotate(
        &self,
        pipeline: &PipelineRef,
        key: &str,
        value: Option<&str>,
    ) -> Result<PipelineRef> {
        let mut state = self.state.lock().unwrap();
        let id = (pipeline.namespace.clone(), pipeline.name.clone());

        if state.pipeline_conflicts > 0 {
            state.pipeline_conflicts -= 1;
            let version = state.bump();
            if let Some(entry) = state.pipelines.get_mut(&id) {
                entry.1 = version;
            }
        }

        let version = state.bump();
        let Some((stored, stored_version)) = state.pipelines.get_mut(&id) else {
            return Err(not_found("Application", &pipeline.namespace, &pipeline.name));
        };
        if pipeline.resource_version.as_deref() != Some(stored_version.to_string().as_str()) {
            return Err(Error::Conflict {
                kind: "Application",
                namespace: pipeline.namespace.clone(),
                name: pipeline.name.clone(),
            });
        }

        match value {
            Some(v) => {
                stored.annotations.insert(key.to_string(), v.to_string());
            }
            None => {
                stored.annotations.remove(key);
            }
        }
        *stored_version = version;

        Ok(PipelineRef {
            resource_version: Some(version.to_string()),
            ..stored.clone()
        })
    }
}
