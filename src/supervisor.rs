use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::crd::{HealthCheck, HealthCheckStatus};
use crate::identity;
use crate::metrics;
use crate::podbuilder::build_checker_pod;
use crate::store::{CheckStore, EventType};
use crate::timeout;

/* ============================= TYPES ============================= */

/// A checker's verdict for a single run.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub ok: bool,
    pub errors: Vec<String>,
}

impl Verdict {
    pub fn pass() -> Self {
        Verdict {
            ok: true,
            errors: Vec::new(),
        }
    }

    pub fn fail(errors: Vec<String>) -> Self {
        Verdict { ok: false, errors }
    }
}

/// Result of a finalize attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The verdict was recorded and the run released.
    Accepted,
    /// The claimed UUID does not match the in-flight run; nothing was written.
    Unauthorized,
}

/* ============================= STATUS TRANSITIONS ============================= */

/// Claim a run on a freshly-read status. Refuses while another run is in
/// flight, which is what makes concurrent starters collapse to one pod.
pub fn apply_claim(status: &mut HealthCheckStatus, uuid: &str, now_unix: i64) -> bool {
    if status.in_flight() {
        return false;
    }
    status.current_uuid = Some(uuid.to_string());
    // lastRunUnix is monotonic even across clock skew
    status.last_run_unix = Some(now_unix.max(status.last_run_unix.unwrap_or(0)));
    status.errors = Vec::new();
    status.pod_name = None;
    true
}

/// Apply a terminal verdict to a freshly-read status. Refuses when the
/// claimed UUID does not match the in-flight run; the caller writes nothing
/// in that case.
pub fn apply_finalize(
    status: &mut HealthCheckStatus,
    uuid: &str,
    verdict: &Verdict,
    now_unix: i64,
) -> bool {
    if !status.uuid_matches(uuid) {
        return false;
    }
    let started = status.last_run_unix.unwrap_or(now_unix);
    let elapsed = (now_unix - started).max(0) as u64;

    status.ok = Some(verdict.ok);
    status.errors = if verdict.ok {
        Vec::new()
    } else {
        verdict.errors.clone()
    };
    status.last_run_duration =
        Some(humantime::format_duration(Duration::from_secs(elapsed)).to_string());
    status.current_uuid = None;
    status.pod_name = None;
    true
}

/* ============================= SUPERVISOR ============================= */

/// Owns the per-run state machine: claim, pod creation, timeout arming,
/// finalization. One supervisor per process; runs never overlap for a single
/// declaration because the UUID is written before the pod exists.
pub struct Supervisor {
    store: CheckStore,
    reporting_url: String,
    /// Active timeout watchers, `namespace/name` → run UUID.
    watchers: Mutex<HashMap<String, String>>,
    shutdown: broadcast::Sender<()>,
}

pub(crate) fn watcher_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl Supervisor {
    pub fn new(store: CheckStore, reporting_url: String, shutdown: broadcast::Sender<()>) -> Self {
        Supervisor {
            store,
            reporting_url,
            watchers: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn store(&self) -> &CheckStore {
        &self.store
    }

    /// Number of runs with an armed timeout watcher.
    pub async fn active_watchers(&self) -> usize {
        self.watchers.lock().await.len()
    }

    pub(crate) async fn release_watcher(&self, namespace: &str, name: &str, uuid: &str) {
        let key = watcher_key(namespace, name);
        let mut watchers = self.watchers.lock().await;
        if watchers.get(&key).map(String::as_str) == Some(uuid) {
            watchers.remove(&key);
        }
    }

    /* ───── start ───── */

    /// Begin a run for a due declaration.
    ///
    /// The UUID is written to status before the pod is created; a concurrent
    /// starter observes the in-flight UUID on its fresh read and aborts, so
    /// exactly one pod exists per run. Pod-creation failure finalizes the run
    /// immediately with a failed verdict.
    pub async fn start(self: &Arc<Self>, check: &HealthCheck) -> Result<(), kube::Error> {
        let name = check.name_any();
        let namespace = check.namespace().unwrap_or_default();
        let uuid = identity::new_run_uuid();
        let now = Utc::now().timestamp();

        let claimed = self
            .store
            .update_status(&namespace, &name, |status| apply_claim(status, &uuid, now))
            .await?;

        if claimed.is_none() {
            info!(check = %name, namespace = %namespace, "run_already_in_flight");
            return Ok(());
        }

        metrics::RUNS_STARTED.inc();
        info!(check = %name, namespace = %namespace, uuid = %uuid, "run_started");

        let run_timeout = check.spec.timeout_or_default();
        let deadline_unix = now + (run_timeout + timeout::TIMEOUT_GRACE).as_secs() as i64;
        let pod = build_checker_pod(check, &uuid, &self.reporting_url, deadline_unix);

        let created = match self.store.create_pod(&pod).await {
            Ok(p) => p,
            Err(e) => {
                self.fail_unstarted_run(check, &namespace, &name, &uuid, &e)
                    .await;
                return Ok(());
            }
        };
        let pod_name = created.name_any();

        let bound = self
            .store
            .update_status(&namespace, &name, |status| {
                if !status.uuid_matches(&uuid) {
                    return false;
                }
                status.pod_name = Some(pod_name.clone());
                true
            })
            .await;
        match bound {
            Ok(Some(_)) => {}
            // the run finalized before we could record the pod name; the
            // reaper will collect the pod
            Ok(None) => {
                info!(check = %name, namespace = %namespace, "run_finalized_before_pod_bind");
                return Ok(());
            }
            Err(e) => {
                warn!(check = %name, namespace = %namespace, error = %e, "pod_name_write_failed");
            }
        }

        self.watchers
            .lock()
            .await
            .insert(watcher_key(&namespace, &name), uuid.clone());
        timeout::arm(
            Arc::clone(self),
            namespace.clone(),
            name.clone(),
            uuid.clone(),
            run_timeout,
            self.shutdown.subscribe(),
        );

        self.store
            .emit_event(
                check,
                EventType::Normal,
                "CheckStarted",
                &format!("check run {uuid} started"),
            )
            .await;
        self.store
            .emit_event(
                check,
                EventType::Normal,
                "PodCreated",
                &format!("created checker pod {pod_name}"),
            )
            .await;

        Ok(())
    }

    async fn fail_unstarted_run(
        &self,
        check: &HealthCheck,
        namespace: &str,
        name: &str,
        uuid: &str,
        err: &kube::Error,
    ) {
        let message = format!("failed to create check pod: {err}");
        warn!(check = %name, namespace = %namespace, error = %err, "pod_create_failed");
        metrics::POD_CREATE_FAILURES.inc();

        let written = self
            .store
            .update_status(namespace, name, |status| {
                if !status.uuid_matches(uuid) {
                    return false;
                }
                status.ok = Some(false);
                status.errors = vec![message.clone()];
                status.current_uuid = None;
                status.pod_name = None;
                true
            })
            .await;
        if let Err(e) = written {
            warn!(check = %name, namespace = %namespace, error = %e, "pod_create_failure_status_write_failed");
        }

        self.store
            .emit_event(check, EventType::Warning, "PodCreateFailed", &message)
            .await;
    }

    /* ───── finalize ───── */

    /// Record a run's terminal verdict and release the in-flight UUID.
    ///
    /// The UUID comparison happens against the freshly-read status inside the
    /// optimistic-concurrency loop, so the first successful finalize clears
    /// the UUID and every later attempt (late reports, peer reporters) lands
    /// on `Unauthorized` with no state change.
    pub async fn finalize(
        &self,
        namespace: &str,
        name: &str,
        uuid: &str,
        verdict: Verdict,
    ) -> Result<FinalizeOutcome, kube::Error> {
        let now = Utc::now().timestamp();

        let updated = self
            .store
            .update_status(namespace, name, |status| {
                apply_finalize(status, uuid, &verdict, now)
            })
            .await?;

        let Some(check) = updated else {
            info!(check = %name, namespace = %namespace, "finalize_rejected_stale_uuid");
            return Ok(FinalizeOutcome::Unauthorized);
        };

        let elapsed_secs = check
            .status
            .as_ref()
            .and_then(|s| s.last_run_unix)
            .map(|started| (now - started).max(0))
            .unwrap_or(0);

        self.release_watcher(namespace, name, uuid).await;
        metrics::RUN_DURATION.observe(elapsed_secs as f64);

        if verdict.ok {
            metrics::RUNS_FINALIZED.with_label_values(&["passed"]).inc();
            self.store
                .emit_event(
                    &check,
                    EventType::Normal,
                    "CheckPassed",
                    &format!(
                        "check passed in {}",
                        humantime::format_duration(Duration::from_secs(elapsed_secs as u64))
                    ),
                )
                .await;
        } else {
            metrics::RUNS_FINALIZED.with_label_values(&["failed"]).inc();
            self.store
                .emit_event(
                    &check,
                    EventType::Warning,
                    "CheckFailed",
                    &format!("check failed: {}", verdict.errors.join("; ")),
                )
                .await;
        }

        info!(
            check = %name,
            namespace = %namespace,
            ok = verdict.ok,
            duration_secs = elapsed_secs,
            "run_finalized"
        );
        Ok(FinalizeOutcome::Accepted)
    }
}

/* ============================= TESTS ============================= */
