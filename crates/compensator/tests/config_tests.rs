//! Integration tests for loading the mounted configuration file.

use std::io::Write;
use std::time::Duration;

use compensator::config::{CompensatorConfig, ReplicaTarget};
use compensator::Error;

// =============================================================================
// Helpers
// =============================================================================

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn load(contents: &str) -> CompensatorConfig {
    let file = write_config(contents);
    CompensatorConfig::from_mounted_file(file.path().to_str().unwrap()).unwrap()
}

// =============================================================================
// Parsing
// =============================================================================

#[test]
fn test_full_file_uses_camel_case_keys() {
    let config = load(
        r"
compensation:
  eligibleTypes: [test, staging]
  appLabel: app.kubernetes.io/name
  typeLabel: tier
  target:
    mode: increment
    by: 2
suppression:
  enabled: true
  annotationKey: argocd.argoproj.io/compare-options
  annotationValue: IgnoreExtraneous
  pipelineNamespace: argocd
  pipelineAppLabel: app.kubernetes.io/instance
sweep:
  intervalSeconds: 60
retry:
  maxAttempts: 3
  initialDelayMs: 100
  maxDelayMs: 1000
  backoffMultiplier: 1.5
  maxConflictRetries: 8
watch:
  reason: DisruptionBlocked
server:
  bindAddress: 127.0.0.1:9000
",
    );

    assert!(config.compensation.is_eligible_type("staging"));
    assert!(!config.compensation.is_eligible_type("prod"));
    assert_eq!(config.compensation.app_label, "app.kubernetes.io/name");
    assert_eq!(config.compensation.type_label, "tier");
    assert_eq!(config.compensation.target, ReplicaTarget::Increment { by: 2 });
    assert_eq!(config.suppression.pipeline_namespace.as_deref(), Some("argocd"));
    assert_eq!(
        config.suppression.pipeline_app_label,
        "app.kubernetes.io/instance"
    );
    assert_eq!(config.sweep.interval(), Duration::from_secs(60));
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.max_conflict_retries, 8);
    assert_eq!(config.server.bind_address, "127.0.0.1:9000");
    config.validate().unwrap();
}

#[test]
fn test_partial_file_keeps_defaults() {
    let config = load(
        r"
sweep:
  intervalSeconds: 120
",
    );

    assert_eq!(config.sweep.interval_seconds, 120);
    assert_eq!(config.compensation.target, ReplicaTarget::Fixed { replicas: 2 });
    assert!(config.compensation.is_eligible_type("test"));
    assert_eq!(
        config.suppression.annotation_key,
        "argocd.argoproj.io/sync-options"
    );
    assert_eq!(config.watch.reason, "DisruptionBlocked");
}

#[test]
fn test_empty_file_is_default() {
    assert_eq!(load(""), CompensatorConfig::default());
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn test_missing_file_is_an_io_error() {
    let err = CompensatorConfig::from_mounted_file("/nonexistent/compensator/config.yaml")
        .unwrap_err();
    assert!(err.downcast_ref::<std::io::Error>().is_some());
}

#[test]
fn test_malformed_yaml_is_rejected() {
    let file = write_config("compensation:\n  target:\n    mode: doubling\n");
    let err = CompensatorConfig::from_mounted_file(file.path().to_str().unwrap()).unwrap_err();
    assert!(err.downcast_ref::<std::io::Error>().is_none());
}

#[test]
fn test_invalid_policy_fails_validation() {
    let config = load(
        r"
compensation:
  eligibleTypes: []
",
    );
    assert!(matches!(config.validate(), Err(Error::Configuration(_))));

    let config = load(
        r"
compensation:
  target:
    mode: fixed
    replicas: 0
",
    );
    assert!(matches!(config.validate(), Err(Error::Configuration(_))));
}
