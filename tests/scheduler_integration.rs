mod common;

use chrono::Utc;
use common::{make_check, with_status};
use kuberhealthy::crd::HealthCheckStatus;
use kuberhealthy::scheduler::is_due;

// ══════════════════════════════════════════════════════════════════
// Scheduler integration tests (no cluster required)
//
// Due-computation over realistic declarations: fresh checks, recently
// run checks, in-flight runs, and deleting declarations.
// ══════════════════════════════════════════════════════════════════

#[test]
fn test_fresh_check_runs_immediately() {
    let check = make_check("ping", "default", "1s", "10s");
    assert!(is_due(&check, Utc::now().timestamp()));
}

#[test]
fn test_hourly_check_just_run_is_not_due() {
    let now = Utc::now().timestamp();
    let check = with_status(
        make_check("hourly", "default", "1h", "5m"),
        HealthCheckStatus {
            last_run_unix: Some(now),
            ..Default::default()
        },
    );
    assert!(!is_due(&check, now));
    // still not due most of the hour later
    assert!(!is_due(&check, now + 3599));
    assert!(is_due(&check, now + 3600));
}

#[test]
fn test_finalized_check_becomes_due_after_interval() {
    let now = 1_700_000_000;
    let check = with_status(
        make_check("ping", "default", "1m", "10s"),
        HealthCheckStatus {
            ok: Some(true),
            last_run_unix: Some(now - 61),
            last_run_duration: Some("2s".to_string()),
            ..Default::default()
        },
    );
    assert!(is_due(&check, now));
}

#[test]
fn test_in_flight_check_never_due() {
    let now = 1_700_000_000;
    let check = with_status(
        make_check("ping", "default", "1s", "10s"),
        HealthCheckStatus {
            last_run_unix: Some(now - 3600),
            current_uuid: Some("still-running".to_string()),
            pod_name: Some("ping-ab12c".to_string()),
            ..Default::default()
        },
    );
    assert!(!is_due(&check, now));
}

#[test]
fn test_deleting_check_never_due() {
    let mut check = make_check("doomed", "default", "1s", "10s");
    check.metadata.deletion_timestamp =
        Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()));
    assert!(!is_due(&check, Utc::now().timestamp() + 3600));
}

#[test]
fn test_unset_interval_uses_ten_minute_default() {
    let now = 1_700_000_000;
    let mut check = make_check("defaulted", "default", "1s", "10s");
    check.spec.run_interval = None;
    let check = with_status(
        check,
        HealthCheckStatus {
            last_run_unix: Some(now - 599),
            ..Default::default()
        },
    );
    assert!(!is_due(&check, now));

    let mut late = check.clone();
    late.status.as_mut().unwrap().last_run_unix = Some(now - 600);
    assert!(is_due(&late, now));
}
