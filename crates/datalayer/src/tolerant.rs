//! Tolerant batch execution.
//!
//! Runs N independent sub-operations, keeps the successes, logs and keeps
//! the failures, and never lets one failure stop the rest.  Used by the
//! per-id fallback of the reference resolver, by the secondary index loader
//! (one sub-operation per dependent collection) and by the audit (one
//! sub-operation per record).

use std::fmt::Display;
use std::future::Future;

use tracing::warn;

/// Successes and failures of one tolerant run, each tagged with its key.
#[derive(Debug)]
pub struct TolerantOutcome<K, T, E> {
    pub succeeded: Vec<(K, T)>,
    pub failed: Vec<(K, E)>,
}

impl<K, T, E> Default for TolerantOutcome<K, T, E> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<K: Display, T, E: Display> TolerantOutcome<K, T, E> {
    fn record(&mut self, label: &str, key: K, result: Result<T, E>) {
        match result {
            Ok(value) => self.succeeded.push((key, value)),
            Err(err) => {
                warn!(operation = label, key = %key, error = %err, "sub-operation failed, skipping");
                self.failed.push((key, err));
            }
        }
    }
}

impl<K, T, E> TolerantOutcome<K, T, E> {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }
}

/// Await `op` for every key, one after another.
pub async fn run_tolerant<K, T, E, F, Fut>(
    label: &str,
    keys: impl IntoIterator<Item = K>,
    mut op: F,
) -> TolerantOutcome<K, T, E>
where
    K: Clone + Display,
    E: Display,
    F: FnMut(K) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut outcome = TolerantOutcome::default();
    for key in keys {
        let result = op(key.clone()).await;
        outcome.record(label, key, result);
    }
    outcome
}

/// Partition already-computed results.  The synchronous counterpart of
/// [`run_tolerant`].
pub fn collect_tolerant<K, T, E>(
    label: &str,
    results: impl IntoIterator<Item = (K, Result<T, E>)>,
) -> TolerantOutcome<K, T, E>
where
    K: Display,
    E: Display,
{
    let mut outcome = TolerantOutcome::default();
    for (key, result) in results {
        outcome.record(label, key, result);
    }
    outcome
}
