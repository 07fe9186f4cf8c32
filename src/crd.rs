use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::PodSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

/* ============================= CONSTANTS ============================= */

/// API group of the current HealthCheck resource.
pub const GROUP: &str = "kuberhealthy.github.io";

/// API version of the current HealthCheck resource.
pub const VERSION: &str = "v2";

/// API group of the legacy KuberhealthyCheck resource, accepted only by the
/// conversion webhook.
pub const LEGACY_GROUP: &str = "comcast.github.io";

/// Finalizer kept on every HealthCheck the scheduler considers live.
pub const FINALIZER: &str = "kuberhealthy.io/kuberhealthycheck";

/// Label carrying the owning check's name on every checker pod.
pub const CHECK_LABEL: &str = "khcheck";

/// Label and annotation carrying the per-run UUID on every checker pod.
pub const RUN_UUID_KEY: &str = "run-uuid";

/// Annotation marking pods created by this controller.
pub const CREATED_BY_ANNOTATION: &str = "createdBy";

/// Annotation carrying the owning check's name.
pub const CHECK_NAME_ANNOTATION: &str = "kuberhealthyCheckName";

/// Annotation carrying the pod creation instant, RFC 3339.
pub const CREATED_TIME_ANNOTATION: &str = "createdTime";

/// Minimum interval between two runs of the same check when the declaration
/// does not set one.
pub const DEFAULT_RUN_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Maximum time a run may occupy when the declaration does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/* ============================= POD TEMPLATE ============================= */

/// Labels and annotations applied to the checker pod before the
/// Kuberhealthy-owned keys are merged on top.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CheckPodTemplateMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// The embedded pod template a checker pod is materialized from.
///
/// `spec` is used verbatim as the basis for the pod; the pod builder only
/// appends the reporting environment and the controller-owned metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CheckPodTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CheckPodTemplateMeta>,

    #[serde(default)]
    pub spec: PodSpec,
}

/* ============================= SPEC ============================= */

/// HealthCheck declares a synthetic check the scheduler runs periodically.
///
/// The operator owns `.spec`; the scheduler owns `.status` and the checker
/// pods derived from the template.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "kuberhealthy.github.io",
    version = "v2",
    kind = "HealthCheck",
    plural = "healthchecks",
    shortname = "khc",
    status = "HealthCheckStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    /// Minimum duration between runs (e.g. "10m"). Defaults to 10 minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_interval: Option<String>,

    /// Maximum duration a run may occupy (e.g. "5m"). Defaults to 5 minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Pod template the checker pod is built from.
    #[serde(default)]
    pub pod_spec: CheckPodTemplate,

    /// Extra labels merged onto the checker pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_labels: Option<BTreeMap<String, String>>,

    /// Extra annotations merged onto the checker pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_annotations: Option<BTreeMap<String, String>>,
}

impl HealthCheckSpec {
    /// The configured run interval, or the 10-minute default.
    ///
    /// An unparseable value falls back to the default with a warning; a
    /// malformed declaration must not stop the scheduler.
    pub fn run_interval_or_default(&self) -> Duration {
        parse_duration_field(self.run_interval.as_deref(), "runInterval", DEFAULT_RUN_INTERVAL)
    }

    /// The configured run timeout, or the 5-minute default.
    pub fn timeout_or_default(&self) -> Duration {
        parse_duration_field(self.timeout.as_deref(), "timeout", DEFAULT_TIMEOUT)
    }
}

fn parse_duration_field(value: Option<&str>, field: &str, default: Duration) -> Duration {
    match value {
        None => default,
        Some(raw) => match humantime::parse_duration(raw) {
            Ok(d) if d > Duration::ZERO => d,
            Ok(_) => {
                warn!(field, value = %raw, "non_positive_duration_using_default");
                default
            }
            Err(e) => {
                warn!(field, value = %raw, error = %e, "unparseable_duration_using_default");
                default
            }
        },
    }
}

/* ============================= STATUS ============================= */

/// HealthCheckStatus is the authoritative per-check record, mutated only by
/// the scheduler.
///
/// `currentUUID` is non-empty exactly while a run is in flight, and then
/// equals the `run-uuid` label on the supervised pod.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckStatus {
    /// Verdict of the last finalized run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,

    /// Failure messages of the last finalized run; empty when `ok`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    /// Start instant of the most recent run, unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_unix: Option<i64>,

    /// Elapsed time of the most recent finalized run (e.g. "12s").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_duration: Option<String>,

    /// UUID of the in-flight run; empty when idle.
    #[serde(
        default,
        rename = "currentUUID",
        skip_serializing_if = "Option::is_none"
    )]
    pub current_uuid: Option<String>,

    /// Name of the currently-supervised pod; empty when idle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
}

impl HealthCheckStatus {
    /// True while a run is in flight.
    pub fn in_flight(&self) -> bool {
        self.current_uuid.as_deref().is_some_and(|u| !u.is_empty())
    }

    /// Exact-equality verification of an inbound run UUID.
    pub fn uuid_matches(&self, uuid: &str) -> bool {
        !uuid.is_empty() && self.current_uuid.as_deref() == Some(uuid)
    }
}

/* ============================= LEGACY RESOURCE ============================= */

/// KuberhealthyCheck is the legacy declaration the conversion webhook
/// upgrades. The legacy layout carries a bare pod spec at the spec root.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "comcast.github.io",
    version = "v1",
    kind = "KuberhealthyCheck",
    plural = "khchecks",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KuberhealthyCheckSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_interval: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Bare pod spec (no template wrapper in v1).
    #[serde(default)]
    pub pod_spec: PodSpec,

    /// Labels for the checker pod; becomes `podSpec.metadata.labels` in v2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_labels: Option<BTreeMap<String, String>>,

    /// Annotations for the checker pod; becomes `podSpec.metadata.annotations` in v2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_annotations: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_annotations: Option<BTreeMap<String, String>>,
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_crd_generates_valid_yaml() {
        let crd = HealthCheck::crd();
        let yaml = serde_yaml::to_string(&crd).expect("CRD should serialize to YAML");
        assert!(yaml.contains("kuberhealthy.github.io"));
        assert!(yaml.contains("HealthCheck"));
        assert!(yaml.contains("healthchecks"));
    }

    #[test]
    fn test_crd_api_group_and_version() {
        let crd = HealthCheck::crd();
        assert_eq!(crd.spec.group, "kuberhealthy.github.io");
        assert!(!crd.spec.versions.is_empty());
        assert_eq!(crd.spec.versions[0].name, "v2");
    }

    #[test]
    fn test_crd_is_namespaced_with_shortname() {
        let crd = HealthCheck::crd();
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(
            crd.spec.names.short_names,
            Some(vec!["khc".to_string()])
        );
    }

    #[test]
    fn test_crd_has_status_subresource() {
        let crd = HealthCheck::crd();
        let version = &crd.spec.versions[0];
        assert!(
            version
                .subresources
                .as_ref()
                .and_then(|s| s.status.as_ref())
                .is_some(),
            "status subresource should be declared"
        );
    }

    #[test]
    fn test_legacy_crd_group() {
        let crd = KuberhealthyCheck::crd();
        assert_eq!(crd.spec.group, "comcast.github.io");
        assert_eq!(crd.spec.versions[0].name, "v1");
        assert_eq!(crd.spec.names.plural, "khchecks");
    }

    #[test]
    fn test_spec_serialization_uses_camel_case() {
        let spec = HealthCheckSpec {
            run_interval: Some("1m".to_string()),
            timeout: Some("30s".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&spec).expect("should serialize");
        assert!(json.contains("runInterval"));
        assert!(json.contains("timeout"));
        assert!(json.contains("podSpec"));
        assert!(!json.contains("run_interval"));
    }

    #[test]
    fn test_spec_omitted_fields_deserialize_as_defaults() {
        let spec: HealthCheckSpec =
            serde_json::from_str("{}").expect("empty object should deserialize");
        assert_eq!(spec.run_interval, None);
        assert_eq!(spec.timeout, None);
        assert_eq!(spec.extra_labels, None);
        assert_eq!(spec.extra_annotations, None);
        assert_eq!(spec.pod_spec, CheckPodTemplate::default());
    }

    #[test]
    fn test_run_interval_default() {
        let spec = HealthCheckSpec::default();
        assert_eq!(spec.run_interval_or_default(), DEFAULT_RUN_INTERVAL);
    }

    #[test]
    fn test_run_interval_parses_humantime() {
        let spec = HealthCheckSpec {
            run_interval: Some("90s".to_string()),
            ..Default::default()
        };
        assert_eq!(spec.run_interval_or_default(), Duration::from_secs(90));
    }

    #[test]
    fn test_timeout_parses_subsecond() {
        let spec = HealthCheckSpec {
            timeout: Some("500ms".to_string()),
            ..Default::default()
        };
        assert_eq!(spec.timeout_or_default(), Duration::from_millis(500));
    }

    #[test]
    fn test_garbage_duration_falls_back_to_default() {
        let spec = HealthCheckSpec {
            run_interval: Some("not-a-duration".to_string()),
            timeout: Some("-5s".to_string()),
            ..Default::default()
        };
        assert_eq!(spec.run_interval_or_default(), DEFAULT_RUN_INTERVAL);
        assert_eq!(spec.timeout_or_default(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_zero_duration_falls_back_to_default() {
        let spec = HealthCheckSpec {
            timeout: Some("0s".to_string()),
            ..Default::default()
        };
        assert_eq!(spec.timeout_or_default(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_status_current_uuid_wire_name() {
        let status = HealthCheckStatus {
            current_uuid: Some("abc".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&status).expect("should serialize");
        assert!(json.contains("currentUUID"));
        assert!(!json.contains("currentUuid"));
    }

    #[test]
    fn test_status_roundtrip() {
        let status = HealthCheckStatus {
            ok: Some(false),
            errors: vec!["boom".to_string()],
            last_run_unix: Some(1_700_000_000),
            last_run_duration: Some("12s".to_string()),
            current_uuid: None,
            pod_name: None,
        };
        let json = serde_json::to_string(&status).expect("should serialize");
        let back: HealthCheckStatus = serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(back, status);
    }

    #[test]
    fn test_status_empty_errors_omitted() {
        let status = HealthCheckStatus {
            ok: Some(true),
            ..Default::default()
        };
        let json = serde_json::to_string(&status).expect("should serialize");
        assert!(!json.contains("errors"));
        assert!(!json.contains("podName"));
    }

    #[test]
    fn test_in_flight() {
        let mut status = HealthCheckStatus::default();
        assert!(!status.in_flight());
        status.current_uuid = Some(String::new());
        assert!(!status.in_flight());
        status.current_uuid = Some("u".to_string());
        assert!(status.in_flight());
    }

    #[test]
    fn test_uuid_matches_is_exact() {
        let status = HealthCheckStatus {
            current_uuid: Some("aaaa-bbbb".to_string()),
            ..Default::default()
        };
        assert!(status.uuid_matches("aaaa-bbbb"));
        assert!(!status.uuid_matches("aaaa-bbbc"));
        assert!(!status.uuid_matches(""));
    }

    #[test]
    fn test_uuid_matches_rejects_empty_against_empty() {
        let status = HealthCheckStatus::default();
        assert!(!status.uuid_matches(""));
    }

    #[test]
    fn test_legacy_spec_deserializes_bare_pod_spec() {
        let json = r#"{
            "runInterval": "10m",
            "timeout": "15m",
            "podSpec": {
                "containers": [
                    {"name": "deployment", "image": "deployment-check:v1"}
                ]
            }
        }"#;
        let spec: KuberhealthyCheckSpec =
            serde_json::from_str(json).expect("legacy spec should deserialize");
        assert_eq!(spec.run_interval.as_deref(), Some("10m"));
        assert_eq!(spec.pod_spec.containers.len(), 1);
        assert_eq!(spec.pod_spec.containers[0].name, "deployment");
    }

    #[test]
    fn test_two_crds_have_distinct_names() {
        let current = HealthCheck::crd();
        let legacy = KuberhealthyCheck::crd();
        assert_ne!(current.spec.names.kind, legacy.spec.names.kind);
        assert_ne!(current.spec.group, legacy.spec.group);
    }
}
