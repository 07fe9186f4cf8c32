use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::{Client, ResourceExt};
use kube_runtime::watcher::Event;
use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use kuberhealthy::config::Settings;
use kuberhealthy::crd::HealthCheck;
use kuberhealthy::ingress::{self, IngressState};
use kuberhealthy::metrics;
use kuberhealthy::reaper::{Reaper, REAP_INTERVAL};
use kuberhealthy::scheduler::{Scheduler, SCHEDULE_INTERVAL};
use kuberhealthy::store::{has_finalizer, CheckStore};
use kuberhealthy::supervisor::Supervisor;

/* ============================= ENTRY ============================= */

pub async fn run(addr_str: &str) -> Result<()> {
    println!("Starting Kuberhealthy operator...\n");
    info!("operator_starting");

    let client = Client::try_default()
        .await
        .context("Failed to connect to Kubernetes cluster")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let settings = Settings::from_env();
    let addr: SocketAddr = addr_str.parse().context("Invalid address format")?;

    println!("  CRD watch ................... HealthCheck.kuberhealthy.github.io/v2");
    println!(
        "  Scheduler interval .......... {}s",
        SCHEDULE_INTERVAL.as_secs()
    );
    println!("  Reaper interval ............. {}s", REAP_INTERVAL.as_secs());
    println!("  Reporting URL ............... {}", settings.reporting_url);
    println!("  HTTP server ................. http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST /externalCheckStatus . Checker-pod status reports");
    println!("    GET  /healthz ............. Liveness probe (always 200 OK)");
    println!("    GET  /readyz .............. Readiness probe (503 until first scan, then 200)");
    println!("    GET  /metrics ............. Prometheus metrics scrape endpoint");
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    metrics::force_init();

    let store = CheckStore::new(client);
    let ready = Arc::new(Mutex::new(false));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let supervisor = Arc::new(Supervisor::new(
        store.clone(),
        settings.reporting_url.clone(),
        shutdown_tx.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        supervisor.clone(),
        ready.clone(),
    ));
    let reaper = Reaper::new(store.clone(), settings);

    let scheduler_shutdown = shutdown_tx.subscribe();
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(scheduler_shutdown).await })
    };

    let reaper_shutdown = shutdown_tx.subscribe();
    let reaper_handle = tokio::spawn(async move { reaper.run(reaper_shutdown).await });

    let watch_store = store.clone();
    let watch_shutdown = shutdown_tx.subscribe();
    let watch_handle = tokio::spawn(async move { watch_checks(watch_store, watch_shutdown).await });

    let ingress_state = IngressState {
        supervisor: supervisor.clone(),
        ready: ready.clone(),
    };
    let ingress_shutdown = shutdown_tx.subscribe();
    let ingress_handle =
        tokio::spawn(async move { ingress::serve(ingress_state, addr, ingress_shutdown).await });

    signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping operator...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());

    let _ = scheduler_handle.await?;
    let _ = reaper_handle.await;
    let _ = watch_handle.await;
    let _ = ingress_handle.await?;

    info!("operator_stopped");
    println!("Operator stopped.");
    Ok(())
}

/* ============================= CHECK WATCH ============================= */

/// Watch every HealthCheck and keep finalizers reconciled: live declarations
/// carry the finalizer; deleting ones have it removed once the scheduler no
/// longer considers them (the checker pod cascade-deletes via its owner
/// reference).
async fn watch_checks(store: CheckStore, mut shutdown: broadcast::Receiver<()>) {
    let mut stream = store.watch_checks().boxed();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("check_watch_stopped");
                return;
            }

            event = stream.next() => {
                match event {
                    Some(Ok(Event::Applied(check))) => {
                        reconcile_finalizer(&store, &check).await;
                    }
                    Some(Ok(Event::Restarted(checks))) => {
                        for check in checks {
                            reconcile_finalizer(&store, &check).await;
                        }
                    }
                    Some(Ok(Event::Deleted(check))) => {
                        info!(
                            check = %check.name_any(),
                            namespace = %check.namespace().unwrap_or_default(),
                            "check_deleted"
                        );
                    }
                    Some(Err(e)) => {
                        // the watcher reconnects on its own; just surface it
                        warn!(error = %e, "check_watch_error");
                    }
                    None => {
                        warn!("check_watch_stream_ended");
                        return;
                    }
                }
            }
        }
    }
}

async fn reconcile_finalizer(store: &CheckStore, check: &HealthCheck) {
    let name = check.name_any();
    let namespace = check.namespace().unwrap_or_default();

    if check.metadata.deletion_timestamp.is_some() {
        if has_finalizer(check)
            && let Err(e) = store.remove_finalizer(check).await
        {
            warn!(check = %name, namespace = %namespace, error = %e, "finalizer_remove_failed");
        }
    } else if !has_finalizer(check)
        && let Err(e) = store.add_finalizer(check).await
    {
        warn!(check = %name, namespace = %namespace, error = %e, "finalizer_add_failed");
    }
}
