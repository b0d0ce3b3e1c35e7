//! Crash accounting.
//!
//! A crashed instance stays visible for a few passes until its deletion
//! reaches the watch cache. The ledger makes sure each crashed instance adds
//! to its build's crash count exactly once.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Whether `crashes` reaches the unhealthy threshold.
///
/// A `None` threshold disables crash-based health.
pub fn crash_threshold_reached(crashes: u32, threshold: Option<u32>) -> bool {
    threshold.is_some_and(|t| crashes >= t)
}

/// Crashed instances already counted, per build.
#[derive(Debug, Default)]
pub struct CrashLedger {
    counted: Mutex<HashMap<String, HashSet<String>>>,
}

impl CrashLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashSet<String>>> {
        self.counted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a crash. Returns true the first time `instance` is seen.
    pub fn record(&self, build: &str, instance: &str) -> bool {
        self.lock()
            .entry(build.to_string())
            .or_default()
            .insert(instance.to_string())
    }

    pub fn contains(&self, build: &str, instance: &str) -> bool {
        self.lock().get(build).is_some_and(|n| n.contains(instance))
    }

    /// Drop entries for instances no longer present.
    pub fn retain_present<F>(&self, build: &str, present: F)
    where
        F: Fn(&str) -> bool,
    {
        let mut counted = self.lock();
        if let Some(names) = counted.get_mut(build) {
            names.retain(|n| present(n));
            if names.is_empty() {
                counted.remove(build);
            }
        }
    }

    pub fn clear_build(&self, build: &str) {
        self.lock().remove(build);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(4, Some(5), false)]
    #[case(5, Some(5), true)]
    #[case(6, Some(5), true)]
    #[case(6, Some(10), false)]
    #[case(100, None, false)]
    #[case(0, Some(0), true)]
    fn test_threshold(#[case] crashes: u32, #[case] threshold: Option<u32>, #[case] reached: bool) {
        assert_eq!(crash_threshold_reached(crashes, threshold), reached);
    }

    #[test]
    fn test_record_once() {
        let ledger = CrashLedger::new();
        assert!(!ledger.contains("b", "gs-1"));
        assert!(ledger.record("b", "gs-1"));
        assert!(!ledger.record("b", "gs-1"));
        assert!(ledger.contains("b", "gs-1"));
        assert!(ledger.record("other", "gs-1"));
    }

    #[test]
    fn test_retain_present() {
        let ledger = CrashLedger::new();
        ledger.record("b", "gs-1");
        ledger.record("b", "gs-2");
        ledger.retain_present("b", |n| n == "gs-2");
        assert!(ledger.record("b", "gs-1"));
        assert!(!ledger.record("b", "gs-2"));

        ledger.clear_build("b");
        assert!(ledger.record("b", "gs-2"));
    }
}
