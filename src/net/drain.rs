//! Outstanding-connection counter.
//!
//! The listener adds one per accepted connection and each connection removes
//! one when it closes. A supervisor blocks on [`DrainGroup::wait`] (or the
//! bounded variant) to learn when every in-flight connection has finished.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Inner {
    count: Mutex<usize>,
    zero: Condvar,
}

/// Cloneable handle to a shared drain counter.
#[derive(Debug, Clone, Default)]
pub struct DrainGroup {
    inner: Arc<Inner>,
}

impl DrainGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.inner
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one more outstanding connection.
    pub fn add(&self) {
        *self.lock() += 1;
    }

    /// Record that one connection finished.
    ///
    /// Saturates at zero; an unmatched call is ignored.
    pub fn done(&self) {
        let mut count = self.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.zero.notify_all();
        }
    }

    /// Current number of outstanding connections.
    pub fn count(&self) -> usize {
        *self.lock()
    }

    /// Block until the counter reaches zero.
    pub fn wait(&self) {
        let mut count = self.lock();
        while *count > 0 {
            count = self
                .inner
                .zero
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the counter reaches zero or `timeout` elapses.
    ///
    /// Returns `true` if fully drained. A timeout too large to represent as
    /// a deadline waits without bound.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => {
                self.wait();
                return true;
            }
        };
        let mut count = self.lock();
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = self
                .inner
                .zero
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_add_and_done() {
        let group = DrainGroup::new();
        group.add();
        group.add();
        assert_eq!(group.count(), 2);
        group.done();
        group.done();
        assert_eq!(group.count(), 0);
    }

    #[test]
    fn test_wait_returns_immediately_when_idle() {
        let group = DrainGroup::new();
        group.wait();
        assert!(group.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let group = DrainGroup::new();
        group.add();
        assert!(!group.wait_timeout(Duration::from_millis(20)));
        assert_eq!(group.count(), 1);
    }

    #[test]
    fn test_unmatched_done_saturates() {
        let group = DrainGroup::new();
        group.done();
        assert_eq!(group.count(), 0);
        group.add();
        assert_eq!(group.count(), 1);
        assert!(!group.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_timeout_unbounded_duration() {
        let group = DrainGroup::new();
        group.add();

        let waiter = {
            let group = group.clone();
            thread::spawn(move || group.wait_timeout(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        group.done();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_wakes_on_last_done() {
        let group = DrainGroup::new();
        for _ in 0..8 {
            group.add();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let group = group.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5));
                    group.done();
                })
            })
            .collect();

        assert!(group.wait_timeout(Duration::from_secs(5)));
        assert_eq!(group.count(), 0);

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
