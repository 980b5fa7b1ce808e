//! Counting barrier: register work up front, signal completion per unit, wait for zero.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct WaitGroup {
    pending: Mutex<usize>,
    cond: Condvar,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `n` more units of outstanding work.
    pub fn add(&self, n: usize) {
        *self.pending.lock() += n;
    }

    /// Mark one unit done.
    pub fn done(&self) {
        let mut pending = self.pending.lock();
        debug_assert!(*pending > 0, "WaitGroup::done called more times than add");
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.cond.notify_all();
        }
    }

    /// Number of units still outstanding.
    pub fn pending(&self) -> usize {
        *self.pending.lock()
    }

    /// Block until every registered unit is done.
    pub fn wait(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.cond.wait(&mut pending);
        }
    }

    /// Block until every registered unit is done or `timeout` elapses.
    /// Returns `true` if the count reached zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        while *pending > 0 {
            if self.cond.wait_until(&mut pending, deadline).timed_out() {
                break;
            }
        }
        *pending == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_returns_after_all_done() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(4);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let wg = wg.clone();
                thread::spawn(move || wg.done())
            })
            .collect();
        wg.wait();
        assert_eq!(wg.pending(), 0);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_wait_timeout_with_outstanding_work() {
        let wg = WaitGroup::new();
        wg.add(1);
        assert!(!wg.wait_timeout(Duration::from_millis(10)));
        wg.done();
        assert!(wg.wait_timeout(Duration::from_millis(10)));
    }
}
