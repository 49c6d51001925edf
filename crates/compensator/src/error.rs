//! Error taxonomy for the compensation and restoration paths.
//!
//! Every cluster call funnels through [`Error::from_kube`] so callers only ever
//! branch on the four kinds they can act on: retry with backoff, re-read and
//! retry, abandon the item, or abandon the item loudly.

use thiserror::Error;

/// Errors raised while compensating or restoring a workload unit
#[derive(Error, Debug)]
pub enum Error {
    /// Network, timeout or rate-limit failure. Retried with backoff.
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    /// The object changed since it was read. Retried from a fresh read.
    #[error("conflict updating {kind} {namespace}/{name}: resource version is stale")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// The object disappeared between read and write.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// Malformed policy or marker data. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A long-running task returned or panicked before shutdown was requested
    #[error("{0} stopped unexpectedly")]
    TaskStopped(String),

    /// Any other Kubernetes API failure
    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),
}

/// Crate-wide result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Classify a kube-rs error raised while operating on `kind` `namespace/name`
    pub fn from_kube(err: kube::Error, kind: &'static str, namespace: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 409 => Error::Conflict {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(ref resp) if resp.code == 404 => Error::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(ref resp) if resp.code == 429 || resp.code >= 500 => {
                Error::TransientInfra(format!("{} ({})", resp.message, resp.code))
            }
            kube::Error::HyperError(e) => Error::TransientInfra(e.to_string()),
            kube::Error::Service(e) => Error::TransientInfra(e.to_string()),
            other => Error::Kube(other),
        }
    }

    /// Check if the error should be retried with backoff
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientInfra(_))
    }

    /// Check if the error is an optimistic concurrency conflict
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Short machine-readable cause used in structured log records and reports
    #[must_use]
    pub fn cause(&self) -> &'static str {
        match self {
            Error::TransientInfra(_) => "transient",
            Error::Conflict { .. } => "conflict",
            Error::NotFound { .. } => "not_found",
            Error::Configuration(_) => "configuration",
            Error::TaskStopped(_) => "task_stopped",
            Error::Kube(_) => "kube",
        }
    }
}
