use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvVar, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use tracing::warn;

use crate::crd::{
    HealthCheck, CHECK_LABEL, CHECK_NAME_ANNOTATION, CREATED_BY_ANNOTATION,
    CREATED_TIME_ANNOTATION, GROUP, RUN_UUID_KEY, VERSION,
};
use crate::identity::pod_suffix;

/* ============================= INJECTED ENV ============================= */

/// Environment contract between the scheduler and every checker container.
pub const ENV_REPORTING_URL: &str = "KH_REPORTING_URL";
pub const ENV_RUN_UUID: &str = "KH_RUN_UUID";
pub const ENV_CHECK_NAME: &str = "KH_CHECK_NAME";
pub const ENV_CHECK_NAMESPACE: &str = "KH_CHECK_NAMESPACE";
pub const ENV_DEADLINE_UNIX: &str = "KH_DEADLINE_UNIX";

/* ============================= POD BUILDER ============================= */

/// Derive a ready-to-submit checker-pod manifest from a declaration, a fresh
/// run UUID, and the reporting-ingress URL.
///
/// The declaration's template spec is used verbatim; the builder only stamps
/// identity metadata and appends the reporting environment.
pub fn build_checker_pod(
    check: &HealthCheck,
    run_uuid: &str,
    reporting_url: &str,
    deadline_unix: i64,
) -> Pod {
    let check_name = check.name_any();
    let namespace = check.namespace().unwrap_or_default();
    let template = &check.spec.pod_spec;

    let mut spec = template.spec.clone();

    // Checker pods run to completion; only an explicit template policy
    // overrides the non-restarting default.
    if spec.restart_policy.is_none() {
        spec.restart_policy = Some("Never".to_string());
    }

    let env = checker_env(&check_name, &namespace, run_uuid, reporting_url, deadline_unix);
    for container in spec.containers.iter_mut() {
        inject_env(container, &env, &check_name);
    }
    if let Some(init_containers) = spec.init_containers.as_mut() {
        for container in init_containers.iter_mut() {
            inject_env(container, &env, &check_name);
        }
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", check_name, pod_suffix(run_uuid))),
            namespace: Some(namespace.clone()),
            owner_references: Some(vec![owner_reference(check)]),
            labels: Some(checker_labels(check, run_uuid)),
            annotations: Some(checker_annotations(check, run_uuid)),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

/// Controller-owner reference so deleting the check cascade-deletes the pod.
fn owner_reference(check: &HealthCheck) -> OwnerReference {
    OwnerReference {
        api_version: format!("{}/{}", GROUP, VERSION),
        kind: "HealthCheck".to_string(),
        name: check.name_any(),
        uid: check.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
        ..Default::default()
    }
}

/// Template labels ⊕ extraLabels ⊕ controller-owned keys; owned keys win.
fn checker_labels(check: &HealthCheck, run_uuid: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();

    if let Some(meta) = &check.spec.pod_spec.metadata
        && let Some(template_labels) = &meta.labels
    {
        labels.extend(template_labels.clone());
    }
    if let Some(extra) = &check.spec.extra_labels {
        labels.extend(extra.clone());
    }

    labels.insert(CHECK_LABEL.to_string(), check.name_any());
    labels.insert(RUN_UUID_KEY.to_string(), run_uuid.to_string());
    labels
}

/// Template annotations ⊕ extraAnnotations ⊕ controller-owned keys; owned
/// keys win.
fn checker_annotations(check: &HealthCheck, run_uuid: &str) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();

    if let Some(meta) = &check.spec.pod_spec.metadata
        && let Some(template_annotations) = &meta.annotations
    {
        annotations.extend(template_annotations.clone());
    }
    if let Some(extra) = &check.spec.extra_annotations {
        annotations.extend(extra.clone());
    }

    annotations.insert(CREATED_BY_ANNOTATION.to_string(), "kuberhealthy".to_string());
    annotations.insert(CHECK_NAME_ANNOTATION.to_string(), check.name_any());
    annotations.insert(
        CREATED_TIME_ANNOTATION.to_string(),
        chrono::Utc::now().to_rfc3339(),
    );
    annotations.insert(RUN_UUID_KEY.to_string(), run_uuid.to_string());
    annotations
}

fn checker_env(
    check_name: &str,
    namespace: &str,
    run_uuid: &str,
    reporting_url: &str,
    deadline_unix: i64,
) -> Vec<EnvVar> {
    let var = |name: &str, value: String| EnvVar {
        name: name.to_string(),
        value: Some(value),
        value_from: None,
    };

    vec![
        var(ENV_REPORTING_URL, reporting_url.to_string()),
        var(ENV_RUN_UUID, run_uuid.to_string()),
        var(ENV_CHECK_NAME, check_name.to_string()),
        var(ENV_CHECK_NAMESPACE, namespace.to_string()),
        var(ENV_DEADLINE_UNIX, deadline_unix.to_string()),
    ]
}

/// Append the reporting env vars to a container, preserving any same-named
/// variable the template already sets.
fn inject_env(container: &mut Container, injected: &[EnvVar], check_name: &str) {
    let env = container.env.get_or_insert_with(Vec::new);

    for var in injected {
        if env.iter().any(|existing| existing.name == var.name) {
            warn!(
                check = %check_name,
                container = %container.name,
                var = %var.name,
                "template_overrides_injected_env"
            );
            continue;
        }
        env.push(var.clone());
    }
}

/* ============================= TESTS ============================= */
