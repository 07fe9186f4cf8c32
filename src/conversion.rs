use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::crd::{
    CheckPodTemplate, CheckPodTemplateMeta, HealthCheck, HealthCheckSpec, KuberhealthyCheck,
    GROUP, LEGACY_GROUP, VERSION,
};

/* ============================= KIND INFERENCE ============================= */

/// Map an admission `resource` name (plural or shortname) to the legacy kind.
/// Older clients submit objects with empty `kind`/`apiVersion`; the admission
/// resource is the only hint left.
pub fn legacy_kind_for_resource(resource: &str) -> Option<&'static str> {
    match resource {
        "khc" | "khcheck" | "khchecks" | "kuberhealthycheck" | "kuberhealthychecks" => {
            Some("KuberhealthyCheck")
        }
        _ => None,
    }
}

/* ============================= CONVERSION ============================= */

/// Produce the v2 twin of a legacy declaration.
///
/// Identity metadata (name, namespace, labels, annotations, finalizers)
/// carries over unchanged. The legacy layout keeps a bare pod spec at the
/// spec root; v2 wraps it under `podSpec.spec`, with the legacy
/// `podLabels`/`podAnnotations` landing in `podSpec.metadata`.
pub fn convert_check(legacy: &KuberhealthyCheck) -> HealthCheck {
    let template_meta = if legacy.spec.pod_labels.is_none() && legacy.spec.pod_annotations.is_none()
    {
        None
    } else {
        Some(CheckPodTemplateMeta {
            labels: legacy.spec.pod_labels.clone(),
            annotations: legacy.spec.pod_annotations.clone(),
        })
    };

    let mut check = HealthCheck::new(
        &legacy.name_any(),
        HealthCheckSpec {
            run_interval: legacy.spec.run_interval.clone(),
            timeout: legacy.spec.timeout.clone(),
            pod_spec: CheckPodTemplate {
                metadata: template_meta,
                spec: legacy.spec.pod_spec.clone(),
            },
            extra_labels: legacy.spec.extra_labels.clone(),
            extra_annotations: legacy.spec.extra_annotations.clone(),
        },
    );

    check.metadata = ObjectMeta {
        name: legacy.metadata.name.clone(),
        namespace: legacy.metadata.namespace.clone(),
        labels: legacy.metadata.labels.clone(),
        annotations: legacy.metadata.annotations.clone(),
        finalizers: legacy.metadata.finalizers.clone(),
        ..Default::default()
    };

    check
}

/// Human-readable warning returned with an allowed conversion response.
pub fn conversion_warning(namespace: &str, name: &str) -> String {
    format!(
        "KuberhealthyCheck {namespace}/{name} ({LEGACY_GROUP}/v1) was converted to \
         HealthCheck {GROUP}/{VERSION}; the legacy resource will be removed"
    )
}

/* ============================= ADMISSION RESPONSE ============================= */

/// Build an AdmissionReview response body. The webhook never returns a JSON
/// patch; the legacy object is allowed to land and cleaned up afterwards.
pub fn build_admission_response(
    uid: &str,
    allowed: bool,
    message: Option<&str>,
    warnings: &[String],
) -> String {
    let mut response = serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": {
            "uid": uid,
            "allowed": allowed
        }
    });

    if let Some(msg) = message {
        response["response"]["status"] = serde_json::json!({ "message": msg });
    }
    if !warnings.is_empty() {
        response["response"]["warnings"] = serde_json::json!(warnings);
    }

    response.to_string()
}

/* ============================= TESTS ============================= */
