use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use kube::ResourceExt;
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::crd::HealthCheck;
use crate::metrics;
use crate::store::CheckStore;
use crate::supervisor::Supervisor;

/* ============================= CONFIG ============================= */

/// Scan cadence. Must stay at or below half of the smallest expected
/// runInterval so due checks are not skipped a whole period.
pub const SCHEDULE_INTERVAL: Duration = Duration::from_secs(30);

/* ============================= DUE COMPUTATION ============================= */

/// A declaration is due when its interval has elapsed since the last run
/// start and no run is in flight. Deleting declarations are never due.
pub fn is_due(check: &HealthCheck, now_unix: i64) -> bool {
    if check.metadata.deletion_timestamp.is_some() {
        return false;
    }

    let status = check.status.clone().unwrap_or_default();
    if status.in_flight() {
        return false;
    }

    let last_run = status.last_run_unix.unwrap_or(0);
    let interval = check.spec.run_interval_or_default().as_secs() as i64;
    last_run + interval <= now_unix
}

/* ============================= SCHEDULER ============================= */

/// The periodic scan loop that decides which declarations are due and hands
/// them to the supervisor. At most one loop per process.
pub struct Scheduler {
    store: CheckStore,
    supervisor: Arc<Supervisor>,
    loop_running: Mutex<bool>,
    ready: Arc<Mutex<bool>>,
}

impl Scheduler {
    pub fn new(store: CheckStore, supervisor: Arc<Supervisor>, ready: Arc<Mutex<bool>>) -> Self {
        Scheduler {
            store,
            supervisor,
            loop_running: Mutex::new(false),
            ready,
        }
    }

    /// Run the scan loop until shutdown. Refuses a second concurrent
    /// invocation in the same process.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        {
            let mut running = self.loop_running.lock().await;
            if *running {
                anyhow::bail!("scheduler loop is already running in this process");
            }
            *running = true;
        }

        info!(interval_secs = SCHEDULE_INTERVAL.as_secs(), "scheduler_started");
        self.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = sleep(SCHEDULE_INTERVAL) => self.tick().await,
            }
        }

        *self.loop_running.lock().await = false;
        info!("scheduler_stopped");
        Ok(())
    }

    /// One scan pass. Start failures are logged per check and never stop the
    /// rest of the pass.
    pub async fn tick(&self) {
        metrics::SCHEDULER_TICKS.inc();

        let checks = match self.store.list_checks().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "check_list_failed");
                return;
            }
        };

        let now = Utc::now().timestamp();
        // Sequential hand-off so a large due set does not storm the API server.
        for check in &checks {
            if !is_due(check, now) {
                continue;
            }

            let name = check.name_any();
            let namespace = check.namespace().unwrap_or_default();
            info!(check = %name, namespace = %namespace, "check_due");

            if let Err(e) = self.supervisor.start(check).await {
                warn!(check = %name, namespace = %namespace, error = %e, "check_start_failed");
            }
        }

        let mut ready = self.ready.lock().await;
        if !*ready {
            *ready = true;
        }
    }
}

/* ============================= TESTS ============================= */
