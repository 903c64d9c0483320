//! Wait/notify gate
//!
//! A binary "condition met" flag guarded by a mutex plus a condition
//! variable. `notify` raises the flag and wakes a waiter; `wait` blocks until
//! the flag is raised and lowers it again before returning, so one
//! notification is consumed by exactly one wait.
//!
//! ```text
//!   notifier                     waiter
//!   --------                     ------
//!   lock; flag = true            lock
//!   signal ───────────────────▶  while !flag { cond.wait }
//!   unlock                       flag = false; unlock
//! ```

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How many waiters a notification wakes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeMode {
    One,
    All,
}

/// Re-armable one-shot gate
#[derive(Debug)]
pub struct Gate {
    met: Mutex<bool>,
    cond: Condvar,
    mode: WakeMode,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    /// Gate that wakes one waiter per notification
    pub fn new() -> Self {
        Self::with_mode(WakeMode::One)
    }

    /// Gate that wakes every waiter; the first to run consumes the flag
    pub fn broadcast() -> Self {
        Self::with_mode(WakeMode::All)
    }

    pub fn with_mode(mode: WakeMode) -> Self {
        Self {
            met: Mutex::new(false),
            cond: Condvar::new(),
            mode,
        }
    }

    pub fn notify(&self) {
        let mut met = lock(&self.met);
        *met = true;
        match self.mode {
            WakeMode::One => self.cond.notify_one(),
            WakeMode::All => self.cond.notify_all(),
        }
    }

    /// Block until notified, then consume the notification
    pub fn wait(&self) {
        let mut met = lock(&self.met);
        while !*met {
            met = self.cond.wait(met).unwrap_or_else(PoisonError::into_inner);
        }
        *met = false;
    }

    /// Like [`Gate::wait`] but gives up after `timeout`
    ///
    /// Returns `true` if a notification was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut met = lock(&self.met);
        while !*met {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(met, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            met = guard;
        }
        *met = false;
        true
    }

    /// Consume a pending notification without blocking
    pub fn try_consume(&self) -> bool {
        let mut met = lock(&self.met);
        std::mem::replace(&mut *met, false)
    }

    /// Drop any pending notification
    pub fn reset(&self) {
        *lock(&self.met) = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_notify_then_wait_consumes() {
        let gate = Gate::new();
        gate.notify();
        gate.wait();
        // Flag consumed: a second wait must block until the timeout
        assert!(!gate.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_double_notify_fires_once() {
        let gate = Gate::new();
        gate.notify();
        gate.notify();
        assert!(gate.try_consume());
        assert!(!gate.try_consume());
    }

    #[test]
    fn test_wait_wakes_from_other_thread() {
        let gate = Arc::new(Gate::new());
        let notifier = Arc::clone(&gate);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            notifier.notify();
        });
        assert!(gate.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_broadcast_single_consumer() {
        let gate = Arc::new(Gate::broadcast());
        let woken = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let gate = Arc::clone(&gate);
            let woken = Arc::clone(&woken);
            handles.push(thread::spawn(move || {
                if gate.wait_timeout(Duration::from_millis(300)) {
                    woken.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        thread::sleep(Duration::from_millis(50));
        gate.notify();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_clears_pending() {
        let gate = Gate::new();
        gate.notify();
        gate.reset();
        assert!(!gate.try_consume());
    }
}
