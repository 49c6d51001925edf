//! kube-rs implementations of the cluster interfaces.
//!
//! Units are `apps/v1` Deployments; pipelines are Argo CD Applications read as
//! dynamic objects. A unit counts as marked when it carries either the marker
//! label or the original-replicas annotation. Writes are JSON merge patches carrying
//! `metadata.resourceVersion`, which the API server treats as a precondition
//! and rejects with 409 when the object moved on.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::cluster::{PipelineStore, WorkloadStore};
use crate::error::{Error, Result};
use crate::model::{
    select_pipeline, CompensationMarker, MarkerChange, PipelineRef, PodInfo, UnitKey, UnitUpdate,
    WorkloadUnit, COMPENSATED_AT_ANNOTATION, MARKER_LABEL, ORIGINAL_REPLICAS_ANNOTATION,
};

const DEPLOYMENT: &str = "Deployment";
const APPLICATION: &str = "Application";

/// Field manager recorded on every patch
const FIELD_MANAGER: &str = "disruption-compensator";

/// Argo CD Application API resource definition.
pub fn argocd_application_api() -> ApiResource {
    ApiResource {
        group: "argoproj.io".to_string(),
        version: "v1alpha1".to_string(),
        api_version: "argoproj.io/v1alpha1".to_string(),
        kind: "Application".to_string(),
        plural: "applications".to_string(),
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..PatchParams::default()
    }
}

/// Convert a Deployment into the compensator's view of it
pub fn unit_from_deployment(deployment: &Deployment) -> Result<WorkloadUnit> {
    let namespace = deployment.namespace().unwrap_or_default();
    let name = deployment.name_any();
    let spec = deployment.spec.as_ref();

    let marker = CompensationMarker::from_metadata(deployment.labels(), deployment.annotations())
        .map_err(|e| match e {
            Error::Configuration(msg) => {
                Error::Configuration(format!("deployment {namespace}/{name}: {msg}"))
            }
            other => other,
        })?;

    Ok(WorkloadUnit {
        selector_labels: spec
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default(),
        // The API server defaults an unset replica count to 1.
        replicas: spec.and_then(|s| s.replicas).unwrap_or(1),
        resource_version: deployment.resource_version(),
        marker,
        namespace,
        name,
    })
}

/// Build the merge patch for a conditional unit update
pub fn unit_patch(update: &UnitUpdate) -> Value {
    let mut metadata = Map::new();
    if let Some(version) = &update.expected_version {
        metadata.insert("resourceVersion".to_string(), json!(version));
    }

    match update.marker {
        MarkerChange::Set(marker) => {
            metadata.insert("labels".to_string(), json!({ MARKER_LABEL: "true" }));
            metadata.insert("annotations".to_string(), json!(marker.to_annotations()));
        }
        MarkerChange::Clear => {
            metadata.insert("labels".to_string(), json!({ MARKER_LABEL: null }));
            metadata.insert(
                "annotations".to_string(),
                json!({
                    ORIGINAL_REPLICAS_ANNOTATION: null,
                    COMPENSATED_AT_ANNOTATION: null,
                }),
            );
        }
    }

    let mut patch = json!({ "metadata": metadata });
    if let Some(replicas) = update.replicas {
        patch["spec"] = json!({ "replicas": replicas });
    }
    patch
}

/// Workload access backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeWorkloadStore {
    client: Client,
}

impl KubeWorkloadStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl WorkloadStore for KubeWorkloadStore {
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<PodInfo>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        let list = pods
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(e, "Node", "", node))?;

        debug!(node = %node, pods = list.items.len(), "Listed pods on node");

        Ok(list
            .items
            .into_iter()
            .map(|pod| PodInfo {
                namespace: pod.namespace().unwrap_or_default(),
                name: pod.name_any(),
                labels: pod.metadata.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn find_units_by_selector(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<Vec<UnitKey>> {
        let params = ListParams::default().labels(&format!("{key}={value}"));
        let list = self
            .deployments(namespace)
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(e, DEPLOYMENT, namespace, value))?;

        Ok(list
            .items
            .iter()
            .map(|d| UnitKey::new(namespace, d.name_any()))
            .collect())
    }

    async fn get_unit(&self, namespace: &str, name: &str) -> Result<WorkloadUnit> {
        let deployment = self
            .deployments(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube(e, DEPLOYMENT, namespace, name))?;
        unit_from_deployment(&deployment)
    }

    async fn list_units_with_marker(&self) -> Result<Vec<UnitKey>> {
        // The label may be gone while the annotation survives.
        let deployments: Api<Deployment> = Api::all(self.client.clone());
        let list = deployments
            .list_metadata(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube(e, DEPLOYMENT, "", ""))?;

        Ok(list
            .items
            .iter()
            .filter(|d| {
                d.labels().contains_key(MARKER_LABEL)
                    || d.annotations().contains_key(ORIGINAL_REPLICAS_ANNOTATION)
            })
            .map(|d| UnitKey::new(d.namespace().unwrap_or_default(), d.name_any()))
            .collect())
    }

    async fn update_unit(&self, update: &UnitUpdate) -> Result<WorkloadUnit> {
        let patch = unit_patch(update);
        let patched = self
            .deployments(&update.namespace)
            .patch(&update.name, &patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, DEPLOYMENT, &update.namespace, &update.name))?;
        unit_from_deployment(&patched)
    }
}

fn pipeline_from_dynamic(app: &DynamicObject) -> PipelineRef {
    PipelineRef {
        namespace: app.namespace().unwrap_or_default(),
        name: app.name_any(),
        resource_version: app.resource_version(),
        labels: app.labels().clone(),
        annotations: app.annotations().clone(),
    }
}

/// Pipeline access backed by Argo CD Application objects
#[derive(Clone)]
pub struct ArgoPipelineStore {
    client: Client,
    api_resource: ApiResource,
}

impl ArgoPipelineStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            api_resource: argocd_application_api(),
        }
    }

    fn applications(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.api_resource)
    }
}

#[async_trait]
impl PipelineStore for ArgoPipelineStore {
    async fn find_pipeline_for_app(
        &self,
        namespace: &str,
        app_id: &str,
        app_label: &str,
    ) -> Result<Option<PipelineRef>> {
        let apps = self.applications(namespace);

        if let Some(app) = apps
            .get_opt(app_id)
            .await
            .map_err(|e| Error::from_kube(e, APPLICATION, namespace, app_id))?
        {
            return Ok(Some(pipeline_from_dynamic(&app)));
        }

        let params = ListParams::default().labels(&format!("{app_label}={app_id}"));
        let list = apps
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(e, APPLICATION, namespace, app_id))?;

        Ok(select_pipeline(
            list.items.iter().map(pipeline_from_dynamic).collect(),
            app_id,
            app_label,
        ))
    }

    async fn annotate(
        &self,
        pipeline: &PipelineRef,
        key: &str,
        value: Option<&str>,
    ) -> Result<PipelineRef> {
        let mut annotations = BTreeMap::new();
        annotations.insert(key.to_string(), value.map_or(Value::Null, |v| json!(v)));

        let mut metadata = Map::new();
        if let Some(version) = &pipeline.resource_version {
            metadata.insert("resourceVersion".to_string(), json!(version));
        }
        metadata.insert("annotations".to_string(), json!(annotations));
        let patch = json!({ "metadata": metadata });

        let patched = self
            .applications(&pipeline.namespace)
            .patch(&pipeline.name, &patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, APPLICATION, &pipeline.namespace, &pipeline.name))?;
        Ok(pipeline_from_dynamic(&patched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::core::ObjectMeta;

    fn deployment(replicas: Option<i32>, labels: BTreeMap<String, String>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("checkout".to_string()),
                namespace: Some("shop".to_string()),
                resource_version: Some("42".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas,
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        "app".to_string(),
                        "checkout".to_string(),
                    )])),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_unit_from_plain_deployment() {
        let unit = unit_from_deployment(&deployment(Some(3), BTreeMap::new())).unwrap();
        assert_eq!(unit.key(), UnitKey::new("shop", "checkout"));
        assert_eq!(unit.replicas, 3);
        assert_eq!(unit.resource_version.as_deref(), Some("42"));
        assert_eq!(unit.selector_labels.get("app").map(String::as_str), Some("checkout"));
        assert!(unit.marker.is_none());
    }

    #[test]
    fn test_unset_replicas_defaults_to_one() {
        let unit = unit_from_deployment(&deployment(None, BTreeMap::new())).unwrap();
        assert_eq!(unit.replicas, 1);
    }

    #[test]
    fn test_label_without_annotation_is_rejected() {
        let labels = BTreeMap::from([(MARKER_LABEL.to_string(), "true".to_string())]);
        let err = unit_from_deployment(&deployment(Some(2), labels)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_compensate_patch_is_conditional() {
        let unit = unit_from_deployment(&deployment(Some(1), BTreeMap::new())).unwrap();
        let patch = unit_patch(&UnitUpdate::compensate(&unit, 2));

        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(patch["metadata"]["labels"][MARKER_LABEL], "true");
        assert_eq!(
            patch["metadata"]["annotations"][ORIGINAL_REPLICAS_ANNOTATION],
            "1"
        );
        assert_eq!(patch["spec"]["replicas"], 2);
    }

    #[test]
    fn test_clear_patch_removes_marker_without_scaling() {
        let unit = unit_from_deployment(&deployment(Some(1), BTreeMap::new())).unwrap();
        let patch = unit_patch(&UnitUpdate::restore(&unit, 1));

        assert!(patch["metadata"]["labels"][MARKER_LABEL].is_null());
        assert!(patch["metadata"]["annotations"][ORIGINAL_REPLICAS_ANNOTATION].is_null());
        assert!(patch.get("spec").is_none());
    }
}
