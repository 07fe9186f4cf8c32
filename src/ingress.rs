use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::metrics::{REGISTRY, REPORTS_RECEIVED};
use crate::supervisor::{FinalizeOutcome, Supervisor, Verdict};

/* ============================= WIRE FORMAT ============================= */

/// The verdict a checker pod POSTs to `/externalCheckStatus`. The run UUID
/// is the only credential; it must match the in-flight run exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub uuid: String,

    #[serde(default)]
    pub errors: Vec<String>,

    pub ok: bool,

    pub check_name: String,

    pub check_namespace: String,
}

/// Decode a report body, mapping serde failures to the plain-text diagnostic
/// returned with a 400.
pub fn decode_report(body: &str) -> std::result::Result<StatusReport, String> {
    serde_json::from_str(body).map_err(|e| format!("malformed status report: {e}"))
}

/* ============================= STATE ============================= */

#[derive(Clone)]
pub struct IngressState {
    pub supervisor: Arc<Supervisor>,
    /// False until the scheduler's first scan pass completes.
    pub ready: Arc<Mutex<bool>>,
}

/* ============================= ROUTER ============================= */

/// Probe and metrics routes. Stateless apart from the readiness flag, so the
/// surface is testable without a Kubernetes client.
pub(crate) fn probe_routes(ready: Arc<Mutex<bool>>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(move || ready_handler(ready.clone())))
        .route("/metrics", get(metrics_handler))
}

pub fn build_ingress_router(state: IngressState) -> Router {
    let ready = state.ready.clone();
    Router::new()
        .route("/externalCheckStatus", post(report_handler))
        .with_state(state)
        .merge(probe_routes(ready))
}

/// Serve the report ingress until shutdown, draining in-flight requests.
pub async fn serve(
    state: IngressState,
    addr: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = build_ingress_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind report ingress")?;

    info!(addr = %addr, "ingress_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

/* ============================= HANDLERS ============================= */

async fn report_handler(
    State(state): State<IngressState>,
    body: String,
) -> impl IntoResponse {
    let report = match decode_report(&body) {
        Ok(r) => r,
        Err(diagnostic) => {
            REPORTS_RECEIVED.with_label_values(&["malformed"]).inc();
            info!(error = %diagnostic, "report_rejected_malformed");
            return (StatusCode::BAD_REQUEST, diagnostic);
        }
    };

    let namespace = report.check_namespace.as_str();
    let name = report.check_name.as_str();

    // Authenticate against a fresh read; cached state would let a report for
    // a finalized run slip through.
    let check = match state.supervisor.store().get_check(namespace, name).await {
        Ok(c) => c,
        Err(kube::Error::Api(err)) if err.code == 404 => {
            REPORTS_RECEIVED.with_label_values(&["not_found"]).inc();
            info!(check = %name, namespace = %namespace, "report_rejected_unknown_check");
            return (
                StatusCode::NOT_FOUND,
                format!("check {namespace}/{name} not found"),
            );
        }
        Err(e) => {
            REPORTS_RECEIVED.with_label_values(&["store_error"]).inc();
            warn!(check = %name, namespace = %namespace, error = %e, "report_check_read_failed");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "check lookup failed; retry".to_string(),
            );
        }
    };

    let authorized = check
        .status
        .as_ref()
        .is_some_and(|s| s.uuid_matches(&report.uuid));
    if !authorized {
        REPORTS_RECEIVED.with_label_values(&["unauthorized"]).inc();
        info!(check = %name, namespace = %namespace, "report_rejected_stale_uuid");
        return (
            StatusCode::UNAUTHORIZED,
            "run UUID does not match the in-flight run".to_string(),
        );
    }

    let verdict = if report.ok {
        Verdict::pass()
    } else {
        Verdict::fail(report.errors.clone())
    };

    match state
        .supervisor
        .finalize(namespace, name, &report.uuid, verdict)
        .await
    {
        Ok(FinalizeOutcome::Accepted) => {
            REPORTS_RECEIVED.with_label_values(&["accepted"]).inc();
            (StatusCode::OK, String::new())
        }
        // lost a race against another reporter or the timeout watcher
        Ok(FinalizeOutcome::Unauthorized) => {
            REPORTS_RECEIVED.with_label_values(&["unauthorized"]).inc();
            (
                StatusCode::UNAUTHORIZED,
                "run UUID does not match the in-flight run".to_string(),
            )
        }
        Err(e) => {
            REPORTS_RECEIVED.with_label_values(&["write_failed"]).inc();
            warn!(check = %name, namespace = %namespace, error = %e, "report_finalize_failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "status update failed; retry".to_string(),
            )
        }
    }
}

async fn ready_handler(ready: Arc<Mutex<bool>>) -> impl IntoResponse {
    if *ready.lock().await {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */
