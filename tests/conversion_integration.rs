use kuberhealthy::conversion::{build_admission_response, conversion_warning, convert_check};
use kuberhealthy::webhook::{evaluate_review, ReviewDisposition};

// ══════════════════════════════════════════════════════════════════
// Legacy conversion integration tests (no cluster required)
//
// Feeds a realistic AdmissionReview through review evaluation and
// conversion, asserting the v2 twin is semantically equal to the
// legacy declaration.
// ══════════════════════════════════════════════════════════════════

fn deployment_check_review() -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "review-uid-1",
            "operation": "CREATE",
            "namespace": "kuberhealthy",
            "resource": {
                "group": "comcast.github.io",
                "version": "v1",
                "resource": "khchecks"
            },
            "object": {
                "apiVersion": "comcast.github.io/v1",
                "kind": "KuberhealthyCheck",
                "metadata": {
                    "name": "deployment",
                    "namespace": "kuberhealthy",
                    "labels": {"app": "kuberhealthy"},
                    "finalizers": ["example.com/hold"]
                },
                "spec": {
                    "runInterval": "10m",
                    "timeout": "15m",
                    "podSpec": {
                        "containers": [{
                            "name": "deployment",
                            "image": "deployment-check:v1",
                            "env": [
                                {"name": "CHECK_DEPLOYMENT_REPLICAS", "value": "4"},
                                {"name": "CHECK_DEPLOYMENT_ROLLING_UPDATE", "value": "true"}
                            ],
                            "resources": {
                                "requests": {"cpu": "25m", "memory": "15Mi"},
                                "limits": {"cpu": "1"}
                            }
                        }]
                    },
                    "extraLabels": {"team": "platform"},
                    "extraAnnotations": {"contact": "sre@example.com"}
                }
            }
        }
    })
}

#[test]
fn test_legacy_review_round_trips_to_equivalent_v2() {
    let review = deployment_check_review();

    let ReviewDisposition::Convert { uid, legacy } = evaluate_review(&review) else {
        panic!("legacy create should convert");
    };
    assert_eq!(uid, "review-uid-1");

    let v2 = convert_check(&legacy);

    // identity
    assert_eq!(v2.metadata.name.as_deref(), Some("deployment"));
    assert_eq!(v2.metadata.namespace.as_deref(), Some("kuberhealthy"));
    assert_eq!(
        v2.metadata
            .labels
            .as_ref()
            .unwrap()
            .get("app")
            .map(String::as_str),
        Some("kuberhealthy")
    );
    assert_eq!(
        v2.metadata.finalizers,
        Some(vec!["example.com/hold".to_string()])
    );

    // timings
    assert_eq!(v2.spec.run_interval.as_deref(), Some("10m"));
    assert_eq!(v2.spec.timeout.as_deref(), Some("15m"));
    assert_eq!(
        v2.spec.run_interval_or_default(),
        std::time::Duration::from_secs(600)
    );
    assert_eq!(
        v2.spec.timeout_or_default(),
        std::time::Duration::from_secs(900)
    );

    // the bare legacy pod spec is wrapped under podSpec.spec
    let containers = &v2.spec.pod_spec.spec.containers;
    assert_eq!(containers.len(), 1);
    let container = &containers[0];
    assert_eq!(container.name, "deployment");
    assert_eq!(container.image.as_deref(), Some("deployment-check:v1"));

    let env = container.env.as_ref().unwrap();
    assert_eq!(env.len(), 2);
    assert_eq!(env[0].name, "CHECK_DEPLOYMENT_REPLICAS");
    assert_eq!(env[0].value.as_deref(), Some("4"));
    assert_eq!(env[1].name, "CHECK_DEPLOYMENT_ROLLING_UPDATE");
    assert_eq!(env[1].value.as_deref(), Some("true"));

    let resources = container.resources.as_ref().unwrap();
    assert_eq!(
        resources.requests.as_ref().unwrap().get("cpu").unwrap().0,
        "25m"
    );
    assert_eq!(
        resources.requests.as_ref().unwrap().get("memory").unwrap().0,
        "15Mi"
    );
    assert_eq!(resources.limits.as_ref().unwrap().get("cpu").unwrap().0, "1");

    // extras
    assert_eq!(
        v2.spec
            .extra_labels
            .as_ref()
            .unwrap()
            .get("team")
            .map(String::as_str),
        Some("platform")
    );
    assert_eq!(
        v2.spec
            .extra_annotations
            .as_ref()
            .unwrap()
            .get("contact")
            .map(String::as_str),
        Some("sre@example.com")
    );
}

#[test]
fn test_conversion_response_allows_with_warning() {
    let warning = conversion_warning("kuberhealthy", "deployment");
    let body = build_admission_response("review-uid-1", true, None, &[warning]);
    let v: serde_json::Value = serde_json::from_str(&body).unwrap();

    assert_eq!(v["response"]["uid"], "review-uid-1");
    assert_eq!(v["response"]["allowed"], true);
    let warnings = v["response"]["warnings"].as_array().unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].as_str().unwrap().contains("converted"));
    // the webhook never mutates the in-flight object
    assert!(v["response"]["patch"].is_null());
}

#[test]
fn test_persist_failure_response_denies_with_message() {
    let body = build_admission_response(
        "review-uid-1",
        false,
        Some("failed to persist converted HealthCheck: connection refused"),
        &[],
    );
    let v: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(v["response"]["allowed"], false);
    assert!(
        v["response"]["status"]["message"]
            .as_str()
            .unwrap()
            .contains("failed to persist")
    );
}

#[test]
fn test_v2_create_passes_through_untouched() {
    let review = serde_json::json!({
        "request": {
            "uid": "review-uid-2",
            "operation": "CREATE",
            "resource": {
                "group": "kuberhealthy.github.io",
                "version": "v2",
                "resource": "healthchecks"
            },
            "object": {
                "apiVersion": "kuberhealthy.github.io/v2",
                "kind": "HealthCheck",
                "metadata": {"name": "modern", "namespace": "default"},
                "spec": {}
            }
        }
    });

    assert!(matches!(
        evaluate_review(&review),
        ReviewDisposition::Allow {
            reason: "group_not_legacy",
            ..
        }
    ));
}
