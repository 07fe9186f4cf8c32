use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::metrics;
use crate::store::EventType;
use crate::supervisor::{FinalizeOutcome, Supervisor, Verdict};

/* ============================= CONFIG ============================= */

/// Grace added on top of the declared timeout before a run is failed, so a
/// report already in flight is not raced.
pub const TIMEOUT_GRACE: Duration = Duration::from_secs(30);

/// How often the watcher re-reads the declaration while waiting.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/* ============================= WATCHER ============================= */

/// Arm a timeout watcher for one run.
///
/// The task re-reads the declaration every two seconds and exits silently as
/// soon as the UUID clears (the run finalized) or shutdown fires (the next
/// process recovers through the reaper). If the deadline expires while the
/// UUID still matches, the run is failed with a timeout verdict.
pub fn arm(
    supervisor: Arc<Supervisor>,
    namespace: String,
    name: String,
    uuid: String,
    run_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let deadline = Instant::now() + run_timeout + TIMEOUT_GRACE;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(check = %name, namespace = %namespace, "timeout_watcher_abandoned");
                    return;
                }
                _ = sleep(POLL_INTERVAL) => {}
            }

            match supervisor.store().get_check(&namespace, &name).await {
                Ok(check) => {
                    let still_ours = check
                        .status
                        .as_ref()
                        .is_some_and(|s| s.uuid_matches(&uuid));
                    if !still_ours {
                        supervisor.release_watcher(&namespace, &name, &uuid).await;
                        return;
                    }
                }
                Err(kube::Error::Api(err)) if err.code == 404 => {
                    // declaration deleted mid-run; the pod cascade-deletes
                    supervisor.release_watcher(&namespace, &name, &uuid).await;
                    return;
                }
                Err(e) => {
                    warn!(check = %name, namespace = %namespace, error = %e, "timeout_watcher_read_failed");
                }
            }

            if Instant::now() >= deadline {
                expire(&supervisor, &namespace, &name, &uuid, run_timeout).await;
                return;
            }
        }
    })
}

async fn expire(
    supervisor: &Arc<Supervisor>,
    namespace: &str,
    name: &str,
    uuid: &str,
    run_timeout: Duration,
) {
    let message = format!(
        "check run timed out after {}",
        humantime::format_duration(run_timeout)
    );

    match supervisor
        .finalize(namespace, name, uuid, Verdict::fail(vec![message.clone()]))
        .await
    {
        Ok(FinalizeOutcome::Accepted) => {
            metrics::RUN_TIMEOUTS.inc();
            warn!(check = %name, namespace = %namespace, timeout = %humantime::format_duration(run_timeout), "run_timed_out");
            if let Ok(check) = supervisor.store().get_check(namespace, name).await {
                supervisor
                    .store()
                    .emit_event(&check, EventType::Warning, "CheckRunTimedOut", &message)
                    .await;
            }
        }
        // a report won the race inside the grace window
        Ok(FinalizeOutcome::Unauthorized) => {
            info!(check = %name, namespace = %namespace, "timeout_lost_race_to_report");
        }
        Err(e) => {
            warn!(check = %name, namespace = %namespace, error = %e, "timeout_finalize_failed");
        }
    }

    supervisor.release_watcher(namespace, name, uuid).await;
}

/* ============================= TESTS ============================= */
