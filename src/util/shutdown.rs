//! Cooperative shutdown signalling for background loops.
//!
//! A [`ShutdownSignal`] is a one-shot latch that background threads poll with
//! a bounded wait. Signals form a tree: triggering a parent triggers every
//! child created from it, while triggering a child leaves the parent alone.
//! The index owns the process-wide root signal and each started shard owns a
//! child of it, so either a global shutdown or a shard close stops the shard's
//! loops.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct SignalInner {
    fired: Mutex<bool>,
    cond: Condvar,
    children: Mutex<Vec<Weak<SignalInner>>>,
}

impl SignalInner {
    fn trigger(&self) {
        {
            let mut fired = self.fired.lock();
            if *fired {
                return;
            }
            *fired = true;
            self.cond.notify_all();
        }
        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.trigger();
            }
        }
    }
}

/// One-shot, cloneable cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a signal that fires when `self` fires, or when triggered directly.
    pub fn child(&self) -> ShutdownSignal {
        let child = ShutdownSignal::new();
        {
            let mut children = self.inner.children.lock();
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        // The parent may have fired between creation and registration.
        if self.is_triggered() {
            child.trigger();
        }
        child
    }

    /// Fire the signal, waking every waiter. Idempotent.
    pub fn trigger(&self) {
        self.inner.trigger();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.fired.lock()
    }

    /// Wait up to `timeout` for the signal. Returns `true` if it fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut fired = self.inner.fired.lock();
        while !*fired {
            if self.inner.cond.wait_until(&mut fired, deadline).timed_out() {
                break;
            }
        }
        *fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_times_out_when_not_triggered() {
        let signal = ShutdownSignal::new();
        let start = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_trigger_wakes_waiter() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait_timeout(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        signal.trigger();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_parent_triggers_child_but_not_reverse() {
        let root = ShutdownSignal::new();
        let first = root.child();
        let second = root.child();

        first.trigger();
        assert!(first.is_triggered());
        assert!(!root.is_triggered());
        assert!(!second.is_triggered());

        root.trigger();
        assert!(second.is_triggered());
    }

    #[test]
    fn test_child_of_fired_parent_is_fired() {
        let root = ShutdownSignal::new();
        root.trigger();
        assert!(root.child().is_triggered());
    }
}
