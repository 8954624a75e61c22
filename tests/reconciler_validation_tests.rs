//! Integration tests for reconciler validation logic
//!
//! These tests verify that the validation functions for each CRD type
//! correctly accept valid specs and reject invalid ones.

mod common;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
use workload_backup_operator::crd::{AzureBackend, Backend, BucketBackend, S3Backend};
use workload_backup_operator::reconcilers::{policy, recovery};

use common::{local_backend, policy as create_policy, policy_spec, request};

// ============================================================================
// BackupPolicy Validation Tests
// ============================================================================

fn s3_backend() -> Backend {
    Backend {
        storage_secret_name: Some("s3-credentials".to_string()),
        s3: Some(S3Backend {
            endpoint: "s3.amazonaws.com".to_string(),
            bucket: "backups".to_string(),
            prefix: Some("apps".to_string()),
        }),
        ..Default::default()
    }
}

#[test]
fn policy_valid_spec_passes_validation() {
    let result = policy::validate(&create_policy("db", policy_spec(&[("app", "db")])));
    if let Err(e) = &result {
        panic!("Validation failed unexpectedly: {:?}", e);
    }
    assert!(result.is_ok());
}

#[test]
fn policy_remote_backends_pass_validation() {
    let mut spec = policy_spec(&[("app", "db")]);
    spec.backend = s3_backend();
    assert!(policy::validate(&create_policy("db", spec.clone())).is_ok());

    spec.backend = Backend {
        storage_secret_name: Some("gcs".to_string()),
        gcs: Some(BucketBackend {
            bucket: "backups".to_string(),
            prefix: None,
        }),
        ..Default::default()
    };
    assert!(policy::validate(&create_policy("db", spec.clone())).is_ok());

    spec.backend = Backend {
        storage_secret_name: Some("azure".to_string()),
        azure: Some(AzureBackend {
            container: "backups".to_string(),
            prefix: None,
        }),
        ..Default::default()
    };
    assert!(policy::validate(&create_policy("db", spec)).is_ok());
}

#[test]
fn policy_local_and_remote_backend_fails_validation() {
    let mut spec = policy_spec(&[("app", "db")]);
    spec.backend.s3 = s3_backend().s3;

    let result = policy::validate(&create_policy("db", spec));

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("exactly one"));
}

#[test]
fn policy_without_backend_location_fails_validation() {
    let mut spec = policy_spec(&[("app", "db")]);
    spec.backend = Backend {
        storage_secret_name: Some("secret".to_string()),
        ..Default::default()
    };

    let result = policy::validate(&create_policy("db", spec));

    assert!(result.is_err());
}

#[test]
fn policy_empty_selector_fails_validation() {
    let spec = policy_spec(&[]);

    let result = policy::validate(&create_policy("db", spec));

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("selector"));
}

#[test]
fn policy_bad_selector_operator_fails_validation() {
    let mut spec = policy_spec(&[("app", "db")]);
    spec.selector.match_expressions = Some(vec![LabelSelectorRequirement {
        key: "tier".to_string(),
        operator: "Matches".to_string(),
        values: Some(vec!["db".to_string()]),
    }]);

    let result = policy::validate(&create_policy("db", spec));

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("operator"));
}

#[test]
fn policy_invalid_schedule_fails_validation() {
    let mut spec = policy_spec(&[("app", "db")]);
    spec.schedule = "not a schedule".to_string();

    let result = policy::validate(&create_policy("db", spec));

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("cron schedule"));
}

#[test]
fn policy_schedule_with_seconds_passes_validation() {
    let mut spec = policy_spec(&[("app", "db")]);
    spec.schedule = "0 0 3 * * * *".to_string();

    assert!(policy::validate(&create_policy("db", spec)).is_ok());
}

#[test]
fn policy_without_file_groups_fails_validation() {
    let mut spec = policy_spec(&[("app", "db")]);
    spec.file_groups.clear();

    let result = policy::validate(&create_policy("db", spec));

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("file group"));
}

#[test]
fn policy_relative_local_path_fails_validation() {
    let mut spec = policy_spec(&[("app", "db")]);
    spec.backend = local_backend("repo");

    let result = policy::validate(&create_policy("db", spec));

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("absolute"));
}

#[test]
fn policy_remote_backend_without_secret_fails_validation() {
    let mut spec = policy_spec(&[("app", "db")]);
    spec.backend = s3_backend();
    spec.backend.storage_secret_name = None;

    let result = policy::validate(&create_policy("db", spec));

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("storageSecretName"));
}

// ============================================================================
// RecoveryRequest Validation Tests
// ============================================================================

#[test]
fn recovery_valid_spec_passes_validation() {
    assert!(recovery::validate(&request("restore", "db", "db")).is_ok());
}

#[test]
fn recovery_missing_policy_fails_validation() {
    let mut rec = request("restore", "db", "db");
    rec.spec.policy.clear();

    let result = recovery::validate(&rec);

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("BackupPolicy"));
}

#[test]
fn recovery_unknown_workload_kind_fails_validation() {
    let mut rec = request("restore", "db", "db");
    rec.spec.workload.kind = "CronJob".to_string();

    let result = recovery::validate(&rec);

    assert!(result.is_err());
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("unrecognized workload kind"));
}

#[test]
fn recovery_statefulset_requires_pod_ordinal() {
    let mut rec = request("restore", "db", "db");
    rec.spec.workload.kind = "StatefulSet".to_string();
    assert!(recovery::validate(&rec).is_err());

    rec.spec.pod_ordinal = Some("0".to_string());
    assert!(recovery::validate(&rec).is_ok());
}

#[test]
fn recovery_daemonset_requires_node_name() {
    let mut rec = request("restore", "db", "db");
    rec.spec.workload.kind = "ds".to_string();
    rec.spec.node_name = None;
    assert!(recovery::validate(&rec).is_err());

    rec.spec.node_name = Some("node-2".to_string());
    assert!(recovery::validate(&rec).is_ok());
}
