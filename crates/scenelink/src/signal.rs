//! One-shot completion signal for async request fulfillment
//!
//! Get and Screenshot requests carry a shared signal: the issuing thread
//! waits on it while a different thread performs the fulfillment and releases
//! it exactly once. Completing an already-completed signal is a no-op.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Inner {
    done: Mutex<bool>,
    cond: Condvar,
}

/// Shared one-shot signal, cloneable; all clones observe the same completion.
#[derive(Debug, Clone, Default)]
pub struct CompletionSignal {
    inner: Arc<Inner>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release the signal. Idempotent; only the first call has an effect.
    pub fn complete(&self) {
        let mut done = self.inner.done.lock().unwrap_or_else(|e| e.into_inner());
        if !*done {
            *done = true;
            self.inner.cond.notify_all();
        }
    }

    pub fn is_complete(&self) -> bool {
        *self.inner.done.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until the signal is released.
    pub fn wait(&self) {
        let mut done = self.inner.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = self
                .inner
                .cond
                .wait(done)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until released or `timeout` elapses. Returns whether the signal
    /// was released. There is no cancellation: a fulfiller may still complete
    /// a signal its requester has given up on.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.inner.done.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = std::time::Instant::now() + timeout;
        while !*done {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(done, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            done = guard;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_complete_releases_waiter() {
        let signal = CompletionSignal::new();
        let fulfiller = signal.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            fulfiller.complete();
        });

        signal.wait();
        assert!(signal.is_complete());
        handle.join().expect("fulfiller panicked");
    }

    #[test]
    fn test_wait_timeout_elapses() {
        let signal = CompletionSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));

        signal.complete();
        assert!(signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_complete_is_idempotent() {
        let signal = CompletionSignal::new();
        signal.complete();
        signal.complete();
        assert!(signal.is_complete());
    }
}
