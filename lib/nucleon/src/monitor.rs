use crate::handle::Handle;
use std::sync::atomic::{AtomicU32, Ordering};

/// Liveness probe for one worker thread. The worker bumps `version` around
/// every callback; the monitor thread compares it against the last value it
/// saw. An unchanged version with a recorded destination means the worker
/// has sat inside the same callback for a whole check interval.
pub struct WorkerMonitor {
    version: AtomicU32,
    check_version: AtomicU32,
    source: AtomicU32,
    destination: AtomicU32,
}

impl WorkerMonitor {
    pub fn new() -> WorkerMonitor {
        WorkerMonitor {
            version: AtomicU32::new(0),
            check_version: AtomicU32::new(0),
            source: AtomicU32::new(0),
            destination: AtomicU32::new(0),
        }
    }

    /// Record the message about to be dispatched; `(0, 0)` marks completion.
    #[inline]
    pub fn trigger(&self, source: Handle, destination: Handle) {
        self.source.store(source, Ordering::Relaxed);
        self.destination.store(destination, Ordering::Relaxed);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// One check interval elapsed: returns the stuck `(source, destination)`
    /// pair if the worker made no progress since the previous check.
    pub fn check(&self) -> Option<(Handle, Handle)> {
        let version = self.version.load(Ordering::Acquire);
        if version == self.check_version.load(Ordering::Relaxed) {
            let destination = self.destination.load(Ordering::Relaxed);
            if destination != 0 {
                return Some((self.source.load(Ordering::Relaxed), destination));
            }
        } else {
            self.check_version.store(version, Ordering::Relaxed);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progressing_worker_is_clean() {
        let m = WorkerMonitor::new();

        m.trigger(1, 2);
        assert_eq!(m.check(), None);
        m.trigger(0, 0);
        assert_eq!(m.check(), None);
    }

    #[test]
    fn test_stuck_worker_detected() {
        let m = WorkerMonitor::new();

        m.trigger(7, 9);
        // First check only records the version...
        assert_eq!(m.check(), None);
        // ...the second, with no progress in between, reports the pair.
        assert_eq!(m.check(), Some((7, 9)));
    }

    #[test]
    fn test_idle_worker_not_reported() {
        let m = WorkerMonitor::new();

        m.trigger(7, 9);
        m.trigger(0, 0);
        assert_eq!(m.check(), None);
        assert_eq!(m.check(), None);
    }
}
