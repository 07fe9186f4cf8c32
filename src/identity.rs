use uuid::Uuid;

/* ============================= RUN IDENTITY ============================= */

/// Generate a fresh opaque run identifier: a version-4 UUID rendered in the
/// canonical hyphenated form. Collision probability is treated as zero; the
/// UUID is the capability a checker pod must echo to report its verdict.
pub fn new_run_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Derive the 5-character pod-name suffix from a run UUID.
///
/// Uses the first five characters of the dash-free rendering, which are
/// always lowercase alphanumerics and therefore valid in a pod name.
pub fn pod_suffix(run_uuid: &str) -> String {
    run_uuid.chars().filter(|c| *c != '-').take(5).collect()
}

/* ============================= TESTS ============================= */
