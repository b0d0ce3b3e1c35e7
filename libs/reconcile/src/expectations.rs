//! Expectation sets.
//!
//! A controller that issues a create or delete sees the result only once the
//! watch cache catches up. Until then it records the object name here, keyed
//! by the owning object, so the next pass neither repeats the write nor
//! miscounts the population.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Names of objects with an outstanding write, grouped by owner key.
#[derive(Debug, Default)]
pub struct Expectations {
    inner: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl Expectations {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BTreeSet<String>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an outstanding write for `name` under `key`.
    pub fn expect(&self, key: &str, name: &str) {
        self.lock()
            .entry(key.to_string())
            .or_default()
            .insert(name.to_string());
    }

    /// Drop an expectation, e.g. because the write failed.
    pub fn forget(&self, key: &str, name: &str) {
        let mut inner = self.lock();
        if let Some(names) = inner.get_mut(key) {
            names.remove(name);
            if names.is_empty() {
                inner.remove(key);
            }
        }
    }

    /// Remove every expectation under `key` for which `settled` returns true.
    ///
    /// Returns how many remain outstanding.
    pub fn settle<F>(&self, key: &str, settled: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut inner = self.lock();
        let Some(names) = inner.get_mut(key) else {
            return 0;
        };
        names.retain(|n| !settled(n));
        let outstanding = names.len();
        if outstanding == 0 {
            inner.remove(key);
        }
        outstanding
    }

    pub fn contains(&self, key: &str, name: &str) -> bool {
        self.lock().get(key).is_some_and(|n| n.contains(name))
    }

    pub fn outstanding(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, BTreeSet::len)
    }

    /// Outstanding names under `key`, sorted.
    pub fn names(&self, key: &str) -> Vec<String> {
        self.lock()
            .get(key)
            .map(|n| n.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all expectations for `key`.
    pub fn clear(&self, key: &str) {
        self.lock().remove(key);
    }
}
