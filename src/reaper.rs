use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::Settings;
use crate::crd::{
    HealthCheck, CHECK_LABEL, CHECK_NAME_ANNOTATION, CREATED_TIME_ANNOTATION,
    DEFAULT_RUN_INTERVAL, DEFAULT_TIMEOUT, RUN_UUID_KEY,
};
use crate::metrics;
use crate::store::{CheckStore, EventType};

/* ============================= CONFIG ============================= */

/// Garbage-collection cadence.
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Succeeded pods are pruned once they are this many run intervals old.
const SUCCEEDED_RETENTION_INTERVALS: u32 = 3;

/* ============================= CLASSIFICATION ============================= */

/// What a reap pass should do with one checker pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodClass {
    /// Still running past its timeout; kill it.
    Overdue,
    /// Succeeded and old enough to prune.
    ExpiredSucceeded,
    /// Failed; subject to the count/age retention policy.
    FailedCandidate,
    Keep,
}

/// Classify a pod by phase and age against its check's timings.
pub fn classify_pod(
    pod: &Pod,
    run_timeout: Duration,
    run_interval: Duration,
    now: DateTime<Utc>,
) -> PodClass {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown");
    let age = pod_age(pod, now);

    match phase {
        "Succeeded" => {
            if age > run_interval * SUCCEEDED_RETENTION_INTERVALS {
                PodClass::ExpiredSucceeded
            } else {
                PodClass::Keep
            }
        }
        "Failed" => PodClass::FailedCandidate,
        // Running, Pending, Unknown
        _ => {
            if age > run_timeout {
                PodClass::Overdue
            } else {
                PodClass::Keep
            }
        }
    }
}

/// Age from the API-server creation timestamp, falling back to the
/// `createdTime` annotation for pods observed before the server stamped them.
pub fn pod_age(pod: &Pod, now: DateTime<Utc>) -> Duration {
    let created = pod
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| {
            pod.annotations()
                .get(CREATED_TIME_ANNOTATION)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|t| t.with_timezone(&Utc))
        });

    match created {
        Some(t) => now.signed_duration_since(t).to_std().unwrap_or(Duration::ZERO),
        None => Duration::ZERO,
    }
}

/// Select the failed pods to delete: everything past the newest
/// `max_failed` entries, plus anything older than `retention`.
pub fn failed_pods_to_delete(
    mut failed: Vec<Pod>,
    max_failed: usize,
    retention: Duration,
    now: DateTime<Utc>,
) -> Vec<Pod> {
    failed.sort_by(|a, b| {
        let ta = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
        let tb = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
        tb.cmp(&ta) // newest first
    });

    failed
        .into_iter()
        .enumerate()
        .filter(|(index, pod)| *index >= max_failed || pod_age(pod, now) > retention)
        .map(|(_, pod)| pod)
        .collect()
}

/* ============================= REAPER ============================= */

/// Periodic pod garbage collector. The reaper is also the recovery path for
/// runs whose timeout watcher was lost with a previous process.
pub struct Reaper {
    store: CheckStore,
    settings: Settings,
}

impl Reaper {
    pub fn new(store: CheckStore, settings: Settings) -> Self {
        Reaper { store, settings }
    }

    /// Run the GC loop until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = REAP_INTERVAL.as_secs(), "reaper_started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = sleep(REAP_INTERVAL) => self.reap().await,
            }
        }
        info!("reaper_stopped");
    }

    /// One GC pass over every checker pod in the cluster.
    pub async fn reap(&self) {
        let pods = match self.store.list_pods(None, CHECK_LABEL).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "reaper_pod_list_failed");
                return;
            }
        };

        let now = Utc::now();
        let mut check_cache: HashMap<(String, String), Option<HealthCheck>> = HashMap::new();
        let mut failed_by_check: HashMap<(String, String), Vec<Pod>> = HashMap::new();

        for pod in pods {
            let namespace = pod.namespace().unwrap_or_default();
            let Some(check_name) = owning_check_name(&pod) else {
                continue;
            };

            let check = self
                .lookup_check(&mut check_cache, &namespace, &check_name)
                .await;
            let (run_timeout, run_interval) = match &check {
                Some(c) => (
                    c.spec.timeout_or_default(),
                    c.spec.run_interval_or_default(),
                ),
                None => (DEFAULT_TIMEOUT, DEFAULT_RUN_INTERVAL),
            };

            match classify_pod(&pod, run_timeout, run_interval, now) {
                PodClass::Keep => {}
                PodClass::Overdue => {
                    self.kill_overdue(&pod, check.as_ref(), run_timeout).await;
                }
                PodClass::ExpiredSucceeded => {
                    self.delete_and_unbind(&pod, &namespace, &check_name, "succeeded_expired")
                        .await;
                }
                PodClass::FailedCandidate => {
                    failed_by_check
                        .entry((namespace.clone(), check_name.clone()))
                        .or_default()
                        .push(pod);
                }
            }
        }

        for ((namespace, check_name), pods) in failed_by_check {
            let doomed = failed_pods_to_delete(
                pods,
                self.settings.max_failed_pods,
                self.settings.failed_pod_retention,
                now,
            );
            for pod in doomed {
                self.delete_and_unbind(&pod, &namespace, &check_name, "failed_retention")
                    .await;
            }
        }
    }

    async fn lookup_check(
        &self,
        cache: &mut HashMap<(String, String), Option<HealthCheck>>,
        namespace: &str,
        name: &str,
    ) -> Option<HealthCheck> {
        let key = (namespace.to_string(), name.to_string());
        if let Some(cached) = cache.get(&key) {
            return cached.clone();
        }

        let fetched = match self.store.get_check(namespace, name).await {
            Ok(check) => Some(check),
            Err(kube::Error::Api(err)) if err.code == 404 => None,
            Err(e) => {
                warn!(check = %name, namespace = %namespace, error = %e, "reaper_check_read_failed");
                None
            }
        };
        cache.insert(key, fetched.clone());
        fetched
    }

    /// Kill a pod that outlived its run timeout. When the pod still carries
    /// the in-flight UUID, the timeout watcher was lost; write the execution
    /// error and release the run here instead.
    async fn kill_overdue(&self, pod: &Pod, check: Option<&HealthCheck>, run_timeout: Duration) {
        let pod_name = pod.name_any();
        let namespace = pod.namespace().unwrap_or_default();

        if let Err(e) = self.store.delete_pod(&namespace, &pod_name).await {
            warn!(pod = %pod_name, namespace = %namespace, error = %e, "reaper_pod_delete_failed");
            return;
        }
        metrics::PODS_REAPED.with_label_values(&["overdue"]).inc();
        info!(pod = %pod_name, namespace = %namespace, "overdue_pod_reaped");

        let Some(check) = check else { return };
        let check_name = check.name_any();
        let pod_uuid = pod.labels().get(RUN_UUID_KEY).cloned().unwrap_or_default();

        let message = format!(
            "checker pod {} exceeded the run timeout of {} and was removed",
            pod_name,
            humantime::format_duration(run_timeout)
        );

        let mut released_run = false;
        let released = self
            .store
            .update_status(&namespace, &check_name, |status| {
                if !status.uuid_matches(&pod_uuid) {
                    // the run already finalized; just drop a stale pod binding
                    if status.pod_name.as_deref() == Some(pod_name.as_str()) {
                        status.pod_name = None;
                        return true;
                    }
                    return false;
                }
                status.ok = Some(false);
                status.errors = vec![message.clone()];
                status.current_uuid = None;
                status.pod_name = None;
                released_run = true;
                true
            })
            .await;

        match released {
            Ok(Some(_)) if released_run => {
                self.store
                    .emit_event(check, EventType::Warning, "CheckRunTimedOut", &message)
                    .await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(check = %check_name, namespace = %namespace, error = %e, "reaper_status_write_failed");
            }
        }
    }

    /// Delete a finished pod and clear the owning check's `podName` when it
    /// still points at it.
    async fn delete_and_unbind(&self, pod: &Pod, namespace: &str, check_name: &str, reason: &str) {
        let pod_name = pod.name_any();

        if let Err(e) = self.store.delete_pod(namespace, &pod_name).await {
            warn!(pod = %pod_name, namespace = %namespace, error = %e, "reaper_pod_delete_failed");
            return;
        }
        metrics::PODS_REAPED.with_label_values(&[reason]).inc();
        info!(pod = %pod_name, namespace = %namespace, reason = %reason, "pod_reaped");

        let pod_uuid = pod.labels().get(RUN_UUID_KEY).cloned().unwrap_or_default();
        let unbound = self
            .store
            .update_status(namespace, check_name, |status| {
                if status.pod_name.as_deref() != Some(pod_name.as_str()) {
                    return false;
                }
                status.pod_name = None;
                // podName and currentUUID clear together
                if status.uuid_matches(&pod_uuid) {
                    status.current_uuid = None;
                }
                true
            })
            .await;

        match unbound {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.code == 404 => {}
            Err(e) => {
                warn!(check = %check_name, namespace = %namespace, error = %e, "reaper_unbind_failed");
            }
        }
    }
}

fn owning_check_name(pod: &Pod) -> Option<String> {
    pod.annotations()
        .get(CHECK_NAME_ANNOTATION)
        .or_else(|| pod.labels().get(CHECK_LABEL))
        .cloned()
}

/* ============================= TESTS ============================= */
