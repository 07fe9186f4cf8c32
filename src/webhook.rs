use std::sync::LazyLock;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use kube::ResourceExt;
use prometheus::{Encoder, Histogram, IntCounterVec, Registry, TextEncoder};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::conversion::{
    build_admission_response, conversion_warning, convert_check, legacy_kind_for_resource,
};
use crate::crd::{KuberhealthyCheck, LEGACY_GROUP};
use crate::store::CheckStore;

/* ============================= CONFIG ============================= */

const LEGACY_DELETE_RETRY: Duration = Duration::from_millis(500);
const LEGACY_DELETE_ATTEMPTS: u32 = 60; // 30 s at 500 ms per attempt

/* ============================= PROMETHEUS ============================= */

pub static WEBHOOK_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static WEBHOOK_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "kuberhealthy_webhook_requests_total",
            "Total conversion webhook requests",
        ),
        &["operation", "allowed"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static CONVERSIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "kuberhealthy_conversions_total",
            "Legacy check conversions by outcome",
        ),
        &["outcome"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static WEBHOOK_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "kuberhealthy_webhook_request_duration_seconds",
        "Duration of conversion webhook request processing in seconds",
    ))
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

/* ============================= STATE ============================= */

#[derive(Clone)]
pub struct WebhookState {
    pub store: CheckStore,
    pub ready: bool,
}

/* ============================= REVIEW EVALUATION ============================= */

/// What the webhook should do with one AdmissionReview.
#[derive(Debug)]
pub enum ReviewDisposition {
    /// Allow the request untouched.
    Allow { uid: String, reason: &'static str },
    /// A legacy declaration to convert and clean up.
    Convert {
        uid: String,
        legacy: Box<KuberhealthyCheck>,
    },
}

/// Pure decision over an AdmissionReview body.
///
/// Everything that is not a create/update of a legacy-group check passes
/// through untouched, including objects this webhook cannot decode; denying
/// here could wedge unrelated API traffic.
pub fn evaluate_review(review: &serde_json::Value) -> ReviewDisposition {
    let Some(request) = review.get("request").filter(|r| !r.is_null()) else {
        return ReviewDisposition::Allow {
            uid: String::new(),
            reason: "no_request",
        };
    };
    let uid = request["uid"].as_str().unwrap_or("").to_string();

    let operation = request["operation"].as_str().unwrap_or("");
    if operation != "CREATE" && operation != "UPDATE" {
        return ReviewDisposition::Allow {
            uid,
            reason: "operation_ignored",
        };
    }

    let mut object = request["object"].clone();
    if object.is_null() {
        return ReviewDisposition::Allow {
            uid,
            reason: "object_missing",
        };
    }

    let object_group = object["apiVersion"]
        .as_str()
        .unwrap_or("")
        .split('/')
        .next()
        .unwrap_or("");
    let resource_group = request["resource"]["group"].as_str().unwrap_or("");
    let group = if object_group.is_empty() {
        resource_group
    } else {
        object_group
    };
    if group != LEGACY_GROUP {
        return ReviewDisposition::Allow {
            uid,
            reason: "group_not_legacy",
        };
    }

    // Old clients submit with empty type metadata; the admission resource is
    // the remaining hint.
    if object["apiVersion"].as_str().unwrap_or("").is_empty() {
        object["apiVersion"] = serde_json::json!(format!("{LEGACY_GROUP}/v1"));
    }
    if object["kind"].as_str().unwrap_or("").is_empty() {
        let resource_plural = request["resource"]["resource"].as_str().unwrap_or("");
        match legacy_kind_for_resource(resource_plural) {
            Some(kind) => object["kind"] = serde_json::json!(kind),
            None => {
                return ReviewDisposition::Allow {
                    uid,
                    reason: "unknown_resource_alias",
                };
            }
        }
    }

    let mut legacy: KuberhealthyCheck = match serde_json::from_value(object) {
        Ok(l) => l,
        Err(e) => {
            warn!(error = %e, "legacy_object_undecodable_allowing");
            return ReviewDisposition::Allow {
                uid,
                reason: "object_undecodable",
            };
        }
    };

    if legacy.metadata.namespace.is_none() {
        legacy.metadata.namespace = request["namespace"].as_str().map(str::to_string);
    }

    ReviewDisposition::Convert {
        uid,
        legacy: Box::new(legacy),
    }
}

/* ============================= ROUTER ============================= */

pub fn build_webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/api/convert", post(convert_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
        .route("/metrics", get(webhook_metrics_handler))
        .with_state(state)
}

async fn ready_handler(state: WebhookState) -> impl IntoResponse {
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn webhook_metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = WEBHOOK_REGISTRY.gather();
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

/* ============================= CONVERT HANDLER ============================= */

async fn convert_handler(State(state): State<WebhookState>, body: String) -> impl IntoResponse {
    let _timer = WEBHOOK_DURATION.start_timer();

    let review: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            info!(error = %e, "invalid_admission_review");
            return (
                StatusCode::BAD_REQUEST,
                build_admission_response("", true, None, &[]),
            );
        }
    };

    let operation = review["request"]["operation"]
        .as_str()
        .unwrap_or("UNKNOWN")
        .to_string();

    match evaluate_review(&review) {
        ReviewDisposition::Allow { uid, reason } => {
            WEBHOOK_REQUESTS
                .with_label_values(&[&operation, "true"])
                .inc();
            info!(reason, "conversion_passthrough");
            (
                StatusCode::OK,
                build_admission_response(&uid, true, None, &[]),
            )
        }
        ReviewDisposition::Convert { uid, legacy } => {
            let name = legacy.name_any();
            let namespace = legacy.namespace().unwrap_or_default();

            let v2 = convert_check(&legacy);
            if let Err(e) = state.store.upsert_check(&v2).await {
                CONVERSIONS.with_label_values(&["persist_failed"]).inc();
                WEBHOOK_REQUESTS
                    .with_label_values(&[&operation, "false"])
                    .inc();
                warn!(check = %name, namespace = %namespace, error = %e, "conversion_persist_failed");
                return (
                    StatusCode::OK,
                    build_admission_response(
                        &uid,
                        false,
                        Some(&format!("failed to persist converted HealthCheck: {e}")),
                        &[],
                    ),
                );
            }

            // The legacy object is allowed to land so old API servers accept
            // the payload; it is cleaned up once its v2 twin exists.
            schedule_legacy_deletion(state.store.clone(), namespace.clone(), name.clone());

            CONVERSIONS.with_label_values(&["converted"]).inc();
            WEBHOOK_REQUESTS
                .with_label_values(&[&operation, "true"])
                .inc();
            info!(check = %name, namespace = %namespace, "legacy_check_converted");

            (
                StatusCode::OK,
                build_admission_response(
                    &uid,
                    true,
                    None,
                    &[conversion_warning(&namespace, &name)],
                ),
            )
        }
    }
}

/* ============================= LEGACY CLEANUP ============================= */

/// Delete the legacy object in the background: retry every 500 ms for up to
/// 30 s, treating NotFound as success.
pub(crate) fn schedule_legacy_deletion(store: CheckStore, namespace: String, name: String) {
    tokio::spawn(async move {
        for attempt in 1..=LEGACY_DELETE_ATTEMPTS {
            match store.delete_legacy_check(&namespace, &name).await {
                Ok(()) => {
                    info!(check = %name, namespace = %namespace, attempt, "legacy_check_deleted");
                    return;
                }
                Err(e) => {
                    if attempt == LEGACY_DELETE_ATTEMPTS {
                        warn!(check = %name, namespace = %namespace, error = %e, "legacy_check_delete_gave_up");
                        return;
                    }
                    sleep(LEGACY_DELETE_RETRY).await;
                }
            }
        }
    });
}

/// Force-init webhook metrics so all series appear on `/metrics` from startup.
pub fn force_init_metrics() {
    LazyLock::force(&WEBHOOK_REQUESTS);
    LazyLock::force(&CONVERSIONS);
    LazyLock::force(&WEBHOOK_DURATION);
}

/* ============================= TESTS ============================= */
