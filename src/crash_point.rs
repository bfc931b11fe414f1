//! Crash point injection for durability testing
//!
//! When `LRLEDGER_CRASH_POINT` names a point, the process aborts the moment
//! execution reaches it: no cleanup, no unwinding, no catching. Crash tests
//! run the binary with the variable set, then reopen the data directory and
//! check what survived.
//!
//! ```bash
//! LRLEDGER_CRASH_POINT=batch_before_commit lrledger process drop/a.json
//! ```

use std::sync::OnceLock;

static CRASH_POINT: OnceLock<Option<String>> = OnceLock::new();

#[inline]
fn get_crash_point() -> Option<&'static str> {
    CRASH_POINT
        .get_or_init(|| std::env::var("LRLEDGER_CRASH_POINT").ok())
        .as_deref()
}

/// Returns true if `LRLEDGER_CRASH_POINT` equals the given name.
#[inline]
pub fn crash_point_enabled(name: &str) -> bool {
    get_crash_point().map(|p| p == name).unwrap_or(false)
}

/// Abort the process if the named crash point is enabled.
///
/// No-op when `LRLEDGER_CRASH_POINT` is unset or names another point.
#[inline]
pub fn maybe_crash(name: &str) {
    if crash_point_enabled(name) {
        eprintln!("[CRASH] Triggering crash at point: {}", name);
        std::process::abort();
    }
}

/// All defined crash point names
pub mod points {
    // Ledger
    pub const LEDGER_BEFORE_APPEND: &str = "ledger_before_append";
    pub const LEDGER_BEFORE_FSYNC: &str = "ledger_before_fsync";
    pub const LEDGER_AFTER_FSYNC: &str = "ledger_after_fsync";

    // Sequence authority
    pub const AFTER_RESERVATION: &str = "after_reservation";

    // Commit coordinator
    pub const BATCH_BEFORE_COMMIT: &str = "batch_before_commit";
    pub const BATCH_AFTER_COMMIT: &str = "batch_after_commit";

    // Orchestrator
    pub const BEFORE_ARTIFACT: &str = "before_artifact";

    /// Get all crash point names
    pub fn all() -> &'static [&'static str] {
        &[
            LEDGER_BEFORE_APPEND,
            LEDGER_BEFORE_FSYNC,
            LEDGER_AFTER_FSYNC,
            AFTER_RESERVATION,
            BATCH_BEFORE_COMMIT,
            BATCH_AFTER_COMMIT,
            BEFORE_ARTIFACT,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_point_disabled_by_default() {
        assert!(!crash_point_enabled("test_point"));
    }

    #[test]
    fn test_all_crash_points_defined() {
        let all = points::all();
        assert_eq!(all.len(), 7);
        assert!(all.contains(&"ledger_after_fsync"));
        assert!(all.contains(&"batch_before_commit"));
    }

    #[test]
    fn test_crash_point_names_are_lowercase_with_underscores() {
        for point in points::all() {
            assert!(
                point.chars().all(|c| c.is_lowercase() || c == '_'),
                "Crash point '{}' should be lowercase with underscores",
                point
            );
        }
    }
}
