use std::time::Duration;

use futures::Stream;
use k8s_openapi::api::core::v1::{Event, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use kube_runtime::watcher::{self, Config};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::crd::{HealthCheck, HealthCheckStatus, KuberhealthyCheck, FINALIZER, GROUP, VERSION};

/* ============================= CONFIG ============================= */

/// Field manager / event source name for every write this process makes.
pub const MANAGER: &str = "kuberhealthy";

const STATUS_UPDATE_ATTEMPTS: u32 = 5;
const STATUS_BACKOFF_BASE_MS: u64 = 50;

/* ============================= EVENT TYPES ============================= */

/// Kubernetes event class for operator-facing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/* ============================= STORE ============================= */

/// Thin typed facade over the Kubernetes API.
///
/// The API server is the sole authoritative store; this type holds nothing
/// but the client.
#[derive(Clone)]
pub struct CheckStore {
    client: Client,
}

impl CheckStore {
    pub fn new(client: Client) -> Self {
        CheckStore { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn checks(&self, namespace: &str) -> Api<HealthCheck> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /* ───── checks ───── */

    pub async fn get_check(&self, namespace: &str, name: &str) -> Result<HealthCheck, kube::Error> {
        self.checks(namespace).get(name).await
    }

    pub async fn list_checks(&self) -> Result<Vec<HealthCheck>, kube::Error> {
        let api: Api<HealthCheck> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    /// Watch stream over every HealthCheck in the cluster. Resumable; a
    /// restart delivers the full current set.
    pub fn watch_checks(
        &self,
    ) -> impl Stream<Item = Result<watcher::Event<HealthCheck>, watcher::Error>> {
        let api: Api<HealthCheck> = Api::all(self.client.clone());
        watcher::watcher(api, Config::default())
    }

    /// Create a check, or replace the existing one of the same name.
    pub async fn upsert_check(&self, check: &HealthCheck) -> Result<HealthCheck, kube::Error> {
        let namespace = check.namespace().unwrap_or_default();
        let name = check.name_any();
        let api = self.checks(&namespace);

        match api.create(&PostParams::default(), check).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                let existing = api.get(&name).await?;
                let mut replacement = check.clone();
                replacement.metadata.resource_version = existing.metadata.resource_version.clone();
                api.replace(&name, &PostParams::default(), &replacement).await
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a legacy KuberhealthyCheck; one that is already gone counts as
    /// deleted.
    pub async fn delete_legacy_check(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let api: Api<KuberhealthyCheck> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Apply a semantic status change under optimistic concurrency.
    ///
    /// Re-reads the declaration and hands the fresh status to `apply`. When
    /// `apply` returns `false` the write is abandoned and `Ok(None)` is
    /// returned; the guard always sees current state, so UUID checks made
    /// inside it cannot race a concurrent finalize. A stale resource version
    /// (409) causes a re-read and re-apply, at most five attempts with
    /// exponential backoff from 50 ms to 800 ms.
    pub async fn update_status<F>(
        &self,
        namespace: &str,
        name: &str,
        mut apply: F,
    ) -> Result<Option<HealthCheck>, kube::Error>
    where
        F: FnMut(&mut HealthCheckStatus) -> bool,
    {
        let api = self.checks(namespace);
        let mut attempt: u32 = 0;

        loop {
            let mut check = api.get(name).await?;
            let mut status = check.status.take().unwrap_or_default();
            if !apply(&mut status) {
                return Ok(None);
            }
            check.status = Some(status);

            let bytes = serde_json::to_vec(&check).map_err(kube::Error::SerdeError)?;

            match api.replace_status(name, &PostParams::default(), bytes).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(kube::Error::Api(err)) if err.code == 409 => {
                    attempt += 1;
                    if attempt >= STATUS_UPDATE_ATTEMPTS {
                        warn!(
                            check = %name,
                            namespace = %namespace,
                            attempts = attempt,
                            "status_update_conflict_retries_exhausted"
                        );
                        return Err(kube::Error::Api(err));
                    }
                    sleep(backoff_delay(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /* ───── finalizers ───── */

    pub async fn add_finalizer(&self, check: &HealthCheck) -> Result<(), kube::Error> {
        let name = check.name_any();
        let namespace = check.namespace().unwrap_or_default();

        let mut finalizers = check.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.checks(&namespace)
            .patch(&name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
            .await?;

        info!(check = %name, namespace = %namespace, "finalizer_added");
        Ok(())
    }

    pub async fn remove_finalizer(&self, check: &HealthCheck) -> Result<(), kube::Error> {
        let name = check.name_any();
        let namespace = check.namespace().unwrap_or_default();

        let patch = serde_json::json!({
            "metadata": { "finalizers": remaining_finalizers(check) }
        });
        self.checks(&namespace)
            .patch(&name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
            .await?;

        info!(check = %name, namespace = %namespace, "finalizer_removed");
        Ok(())
    }

    /* ───── pods ───── */

    pub async fn create_pod(&self, pod: &Pod) -> Result<Pod, kube::Error> {
        let namespace = pod.namespace().unwrap_or_default();
        self.pods(&namespace)
            .create(&PostParams::default(), pod)
            .await
    }

    /// Delete a pod; a pod that is already gone counts as deleted.
    pub async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        match self.pods(namespace).delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, kube::Error> {
        self.pods(namespace).get(name).await
    }

    /// List pods matching a label selector, across all namespaces when
    /// `namespace` is `None`.
    pub async fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: &str,
    ) -> Result<Vec<Pod>, kube::Error> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let params = ListParams::default().labels(selector);
        Ok(api.list(&params).await?.items)
    }

    /* ───── events ───── */

    /// Emit an operator-facing event on a HealthCheck. Best-effort: failures
    /// are logged and never returned.
    pub async fn emit_event(
        &self,
        check: &HealthCheck,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        let name = check.name_any();
        let namespace = check.namespace().unwrap_or_default();
        let now = chrono::Utc::now();

        let event = Event {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(format!("{}-{}", name, now.timestamp_millis())),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            involved_object: event_object_ref(check),
            type_: Some(event_type.as_str().to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            event_time: Some(MicroTime(now)),
            reporting_component: Some(MANAGER.to_string()),
            reporting_instance: Some(MANAGER.to_string()),
            action: Some(reason.to_string()),
            count: Some(1),
            ..Default::default()
        };

        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        if let Err(e) = events.create(&PostParams::default(), &event).await {
            warn!(
                check = %name,
                namespace = %namespace,
                reason = %reason,
                error = %e,
                "event_emit_failed"
            );
        }
    }
}

/* ============================= HELPERS ============================= */

/// True when the check carries the Kuberhealthy finalizer.
pub fn has_finalizer(check: &HealthCheck) -> bool {
    check.finalizers().iter().any(|f| f == FINALIZER)
}

fn remaining_finalizers(check: &HealthCheck) -> Vec<String> {
    check
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect()
}

fn event_object_ref(check: &HealthCheck) -> ObjectReference {
    ObjectReference {
        api_version: Some(format!("{}/{}", GROUP, VERSION)),
        kind: Some("HealthCheck".to_string()),
        name: Some(check.name_any()),
        namespace: check.namespace(),
        uid: check.uid(),
        ..Default::default()
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    // 50ms, 100ms, 200ms, 400ms, capped at 800ms
    let ms = STATUS_BACKOFF_BASE_MS * 2u64.pow(attempt.saturating_sub(1)).min(16);
    Duration::from_millis(ms.min(800))
}

/* ============================= TESTS ============================= */
