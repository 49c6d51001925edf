//! Workload, pipeline and signal types shared by the watcher, locator,
//! compensator and sweeper.
//!
//! The compensation marker lives on the Deployment itself: a label so marked
//! units can be listed with a selector, plus annotations carrying the
//! pre-compensation replica count and the time it was captured.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Event;

use crate::error::{Error, Result};

/// Label present on every unit under active compensation
pub const MARKER_LABEL: &str = "compensator.5dlabs.com/compensated";

/// Annotation holding the replica count captured before compensation
pub const ORIGINAL_REPLICAS_ANNOTATION: &str = "compensator.5dlabs.com/original-replicas";

/// Annotation holding the RFC 3339 time the marker was written
pub const COMPENSATED_AT_ANNOTATION: &str = "compensator.5dlabs.com/compensated-at";

/// Kind of the object an event is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvolvedKind {
    Node,
    Other(String),
}

impl From<&str> for InvolvedKind {
    fn from(kind: &str) -> Self {
        if kind == "Node" {
            InvolvedKind::Node
        } else {
            InvolvedKind::Other(kind.to_string())
        }
    }
}

/// A cluster event, resolved once at the stream boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisruptionSignal {
    pub reason: String,
    pub involved_kind: InvolvedKind,
    pub involved_name: String,
    pub observed_at: Option<DateTime<Utc>>,
}

impl DisruptionSignal {
    /// Convert a raw `core/v1` Event
    pub fn from_event(event: &Event) -> Self {
        let observed_at = event
            .last_timestamp
            .as_ref()
            .map(|t| t.0)
            .or_else(|| event.event_time.as_ref().map(|t| t.0))
            .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0));

        Self {
            reason: event.reason.clone().unwrap_or_default(),
            involved_kind: InvolvedKind::from(
                event.involved_object.kind.as_deref().unwrap_or_default(),
            ),
            involved_name: event.involved_object.name.clone().unwrap_or_default(),
            observed_at,
        }
    }

    /// Returns the node name if this signal reports a blocked disruption on a node
    pub fn blocked_node(&self, reason: &str) -> Option<&str> {
        (self.reason == reason
            && self.involved_kind == InvolvedKind::Node
            && !self.involved_name.is_empty())
        .then_some(self.involved_name.as_str())
    }
}

/// A pod as seen by the locator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Durable record that a unit was scaled up and must be restored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompensationMarker {
    pub original_replicas: i32,
    pub set_at: DateTime<Utc>,
}

impl CompensationMarker {
    #[must_use]
    pub fn new(original_replicas: i32) -> Self {
        Self {
            original_replicas,
            set_at: Utc::now(),
        }
    }

    /// Decode the marker from object labels and annotations.
    ///
    /// Returns `Ok(None)` for unmarked units and a configuration error when the
    /// label is present but the annotations are missing or malformed.
    pub fn from_metadata(
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Option<Self>> {
        let labelled = labels.get(MARKER_LABEL).is_some_and(|v| v == "true");
        let Some(raw) = annotations.get(ORIGINAL_REPLICAS_ANNOTATION) else {
            if labelled {
                return Err(Error::Configuration(format!(
                    "marker label present but {ORIGINAL_REPLICAS_ANNOTATION} is missing"
                )));
            }
            return Ok(None);
        };

        let original_replicas: i32 = raw.trim().parse().map_err(|_| {
            Error::Configuration(format!(
                "{ORIGINAL_REPLICAS_ANNOTATION} is not a replica count: '{raw}'"
            ))
        })?;
        if original_replicas < 0 {
            return Err(Error::Configuration(format!(
                "{ORIGINAL_REPLICAS_ANNOTATION} is negative: {original_replicas}"
            )));
        }

        // A missing or unparseable timestamp does not block restoration.
        let set_at = annotations
            .get(COMPENSATED_AT_ANNOTATION)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map_or_else(Utc::now, |ts| ts.with_timezone(&Utc));

        Ok(Some(Self {
            original_replicas,
            set_at,
        }))
    }

    /// Annotations written alongside the marker label
    pub fn to_annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                ORIGINAL_REPLICAS_ANNOTATION.to_string(),
                self.original_replicas.to_string(),
            ),
            (COMPENSATED_AT_ANNOTATION.to_string(), self.set_at.to_rfc3339()),
        ])
    }
}

/// Restoration state of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Normal,
    Compensated,
    Restoring,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::Normal => write!(f, "Normal"),
            UnitState::Compensated => write!(f, "Compensated"),
            UnitState::Restoring => write!(f, "Restoring"),
        }
    }
}

/// Identity of a workload unit
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitKey {
    pub namespace: String,
    pub name: String,
}

impl UnitKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A scalable workload (Deployment) as seen by the compensator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadUnit {
    pub namespace: String,
    pub name: String,
    pub selector_labels: BTreeMap<String, String>,
    pub replicas: i32,
    /// Version observed at read time; writes are conditioned on it
    pub resource_version: Option<String>,
    pub marker: Option<CompensationMarker>,
}

impl WorkloadUnit {
    pub fn key(&self) -> UnitKey {
        UnitKey::new(&self.namespace, &self.name)
    }

    pub fn state(&self) -> UnitState {
        if self.marker.is_some() {
            UnitState::Compensated
        } else {
            UnitState::Normal
        }
    }
}

/// How an update treats the compensation marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerChange {
    /// Write the marker label and annotations
    Set(CompensationMarker),
    /// Remove the marker label and annotations
    Clear,
}

/// A conditional write against a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitUpdate {
    /// Namespace of the target unit
    pub namespace: String,
    /// Name of the target unit
    pub name: String,
    /// Write is rejected with a conflict if the unit's version differs
    pub expected_version: Option<String>,
    /// New replica count; `None` leaves `spec.replicas` untouched
    pub replicas: Option<i32>,
    /// Marker written or removed by the same update
    pub marker: MarkerChange,
}

impl UnitUpdate {
    /// Scale `unit` to `target` and record its current count
    pub fn compensate(unit: &WorkloadUnit, target: i32) -> Self {
        Self {
            namespace: unit.namespace.clone(),
            name: unit.name.clone(),
            expected_version: unit.resource_version.clone(),
            replicas: Some(target),
            marker: MarkerChange::Set(CompensationMarker::new(unit.replicas)),
        }
    }

    /// Scale `unit` back to `original` (if needed) and drop the marker
    pub fn restore(unit: &WorkloadUnit, original: i32) -> Self {
        Self {
            namespace: unit.namespace.clone(),
            name: unit.name.clone(),
            expected_version: unit.resource_version.clone(),
            replicas: (unit.replicas != original).then_some(original),
            marker: MarkerChange::Clear,
        }
    }
}

/// A delivery pipeline (Argo CD Application)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineRef {
    pub namespace: String,
    pub name: String,
    pub resource_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl PipelineRef {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Pick the pipeline for `app_id`: exact name match first, then label match,
/// ties broken by the lexicographically smallest name.
pub fn select_pipeline(
    candidates: Vec<PipelineRef>,
    app_id: &str,
    app_label: &str,
) -> Option<PipelineRef> {
    let (by_name, rest): (Vec<_>, Vec<_>) =
        candidates.into_iter().partition(|p| p.name == app_id);
    if let Some(exact) = by_name.into_iter().next() {
        return Some(exact);
    }
    rest.into_iter()
        .filter(|p| p.labels.get(app_label).is_some_and(|v| v == app_id))
        .min_by(|a, b| a.name.cmp(&b.name))
}
