#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use kuberhealthy::crd::{
    CheckPodTemplate, HealthCheck, HealthCheckSpec, HealthCheckStatus, CHECK_LABEL, RUN_UUID_KEY,
};

pub fn make_check(name: &str, namespace: &str, run_interval: &str, timeout: &str) -> HealthCheck {
    let mut check = HealthCheck::new(
        name,
        HealthCheckSpec {
            run_interval: Some(run_interval.to_string()),
            timeout: Some(timeout.to_string()),
            pod_spec: CheckPodTemplate {
                metadata: None,
                spec: PodSpec {
                    containers: vec![Container {
                        name: "main".to_string(),
                        image: Some("busybox".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            },
            ..Default::default()
        },
    );
    check.metadata.namespace = Some(namespace.to_string());
    check.metadata.uid = Some(format!("{name}-uid"));
    check
}

pub fn with_status(mut check: HealthCheck, status: HealthCheckStatus) -> HealthCheck {
    check.status = Some(status);
    check
}

pub fn make_checker_pod(
    check_name: &str,
    pod_name: &str,
    uuid: &str,
    phase: &str,
    age: Duration,
    now: DateTime<Utc>,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some("default".to_string()),
            creation_timestamp: Some(Time(now - chrono::Duration::from_std(age).unwrap())),
            labels: Some(BTreeMap::from([
                (CHECK_LABEL.to_string(), check_name.to_string()),
                (RUN_UUID_KEY.to_string(), uuid.to_string()),
            ])),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}
