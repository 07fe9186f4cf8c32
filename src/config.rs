use std::time::Duration;

use tracing::warn;

/* ============================= DEFAULTS ============================= */

/// Reporting URL injected into checker pods when `KH_REPORTING_URL` is unset.
pub const DEFAULT_REPORTING_URL: &str =
    "http://kuberhealthy.kuberhealthy.svc.cluster.local/externalCheckStatus";

const DEFAULT_FAILED_POD_RETENTION_DAYS: u64 = 4;
const DEFAULT_MAX_FAILED_PODS: usize = 5;

/* ============================= SETTINGS ============================= */

/// Process configuration resolved from the environment once at startup.
///
/// Scheduler and reaper cadences are deliberately not exposed; they are
/// internal constants tuned to API-server politeness.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Absolute URL checker pods POST their verdict to.
    pub reporting_url: String,

    /// How long failed checker pods are retained before the reaper prunes them.
    pub failed_pod_retention: Duration,

    /// How many failed checker pods are kept per check, newest first.
    pub max_failed_pods: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            reporting_url: DEFAULT_REPORTING_URL.to_string(),
            failed_pod_retention: Duration::from_secs(
                DEFAULT_FAILED_POD_RETENTION_DAYS * 24 * 60 * 60,
            ),
            max_failed_pods: DEFAULT_MAX_FAILED_PODS,
        }
    }
}

impl Settings {
    /// Resolve settings from `KH_*` environment variables.
    ///
    /// Unparseable values fall back to defaults with a warning; a broken
    /// environment must not keep the operator from starting.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();

        if let Ok(url) = std::env::var("KH_REPORTING_URL")
            && !url.is_empty()
        {
            settings.reporting_url = url;
        }

        if let Some(days) = parse_env_u64("KH_ERROR_POD_RETENTION_DAYS") {
            settings.failed_pod_retention = Duration::from_secs(days * 24 * 60 * 60);
        }

        if let Some(count) = parse_env_u64("KH_MAX_ERROR_POD_COUNT") {
            settings.max_failed_pods = count as usize;
        }

        settings
    }
}

fn parse_env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(var = name, value = %raw, error = %e, "unparseable_env_var_using_default");
            None
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env-var tests mutate shared process state; serialize them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.reporting_url, DEFAULT_REPORTING_URL);
        assert_eq!(s.failed_pod_retention, Duration::from_secs(4 * 24 * 60 * 60));
        assert_eq!(s.max_failed_pods, 5);
    }

    #[test]
    fn test_from_env_overrides_retention() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("KH_ERROR_POD_RETENTION_DAYS", "2") };
        let s = Settings::from_env();
        assert_eq!(s.failed_pod_retention, Duration::from_secs(2 * 24 * 60 * 60));
        unsafe { std::env::remove_var("KH_ERROR_POD_RETENTION_DAYS") };
    }

    #[test]
    fn test_from_env_overrides_max_failed_pods() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("KH_MAX_ERROR_POD_COUNT", "9") };
        let s = Settings::from_env();
        assert_eq!(s.max_failed_pods, 9);
        unsafe { std::env::remove_var("KH_MAX_ERROR_POD_COUNT") };
    }

    #[test]
    fn test_from_env_garbage_falls_back() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("KH_MAX_ERROR_POD_COUNT", "many") };
        let s = Settings::from_env();
        assert_eq!(s.max_failed_pods, DEFAULT_MAX_FAILED_PODS);
        unsafe { std::env::remove_var("KH_MAX_ERROR_POD_COUNT") };
    }

    #[test]
    fn test_from_env_reporting_url() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("KH_REPORTING_URL", "http://127.0.0.1:8080/externalCheckStatus")
        };
        let s = Settings::from_env();
        assert_eq!(s.reporting_url, "http://127.0.0.1:8080/externalCheckStatus");
        unsafe { std::env::remove_var("KH_REPORTING_URL") };
    }

    #[test]
    fn test_from_env_empty_reporting_url_keeps_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("KH_REPORTING_URL", "") };
        let s = Settings::from_env();
        assert_eq!(s.reporting_url, DEFAULT_REPORTING_URL);
        unsafe { std::env::remove_var("KH_REPORTING_URL") };
    }
}
