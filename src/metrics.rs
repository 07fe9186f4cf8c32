use std::sync::LazyLock;

use prometheus::{Histogram, IntCounter, IntCounterVec, Registry};

/* ============================= OPERATOR REGISTRY ============================= */

/// Registry behind the operator's `/metrics` endpoint. The webhook server
/// keeps its own registry; the two processes never share one.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static SCHEDULER_TICKS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "kuberhealthy_scheduler_ticks_total",
        "Total scheduler scan passes",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static RUNS_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "kuberhealthy_check_runs_started_total",
        "Total check runs started by the scheduler",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static RUNS_FINALIZED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "kuberhealthy_check_runs_finalized_total",
            "Total check runs finalized, by verdict",
        ),
        &["result"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static RUN_TIMEOUTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "kuberhealthy_check_run_timeouts_total",
        "Total check runs failed by the timeout watcher",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static POD_CREATE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "kuberhealthy_pod_create_failures_total",
        "Total checker-pod creation failures",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static REPORTS_RECEIVED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "kuberhealthy_reports_received_total",
            "Status reports received on the ingress, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static PODS_REAPED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "kuberhealthy_pods_reaped_total",
            "Checker pods deleted by the reaper, by reason",
        ),
        &["reason"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static RUN_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "kuberhealthy_check_run_duration_seconds",
        "Duration of finalized check runs in seconds",
    ))
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

/// Force-init every metric so all series appear on `/metrics` from startup.
pub fn force_init() {
    LazyLock::force(&SCHEDULER_TICKS);
    LazyLock::force(&RUNS_STARTED);
    LazyLock::force(&RUNS_FINALIZED);
    LazyLock::force(&RUN_TIMEOUTS);
    LazyLock::force(&POD_CREATE_FAILURES);
    LazyLock::force(&REPORTS_RECEIVED);
    LazyLock::force(&PODS_REAPED);
    LazyLock::force(&RUN_DURATION);
}

/* ============================= TESTS ============================= */
