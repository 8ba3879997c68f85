#![allow(dead_code)] // each test binary uses its own slice of these helpers

use std::collections::HashSet;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

// -----------------------------------------------------------------------------
// ExecutionTracker

/// Thread-safe record of which labeled steps ran, and in what order.
#[derive(Default)]
pub struct ExecutionTracker {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl ExecutionTracker {
    pub fn record(&self, id: impl Into<String>) {
        let id = id.into();
        let mut inner = self.inner.lock().unwrap();
        inner.order.push(id.clone());
        inner.seen.insert(id);
    }

    pub fn was_executed(&self, id: &str) -> bool {
        self.inner.lock().unwrap().seen.contains(id)
    }

    pub fn execution_count(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }

    /// Whether step `a` was recorded before step `b`; false if either is
    /// missing.
    pub fn executed_before(&self, a: &str, b: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        let a = inner.order.iter().position(|id| id == a);
        let b = inner.order.iter().position(|id| id == b);
        matches!((a, b), (Some(a), Some(b)) if a < b)
    }
}

// -----------------------------------------------------------------------------
// eventually

/// Polls `condition` for a couple of seconds.
///
/// Statistics are recorded after a job's final step runs, so a waiter that
/// just observed its counter hit zero can be a hair ahead of the last
/// recording.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..2_000 {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}
