//! Outstanding-request limiter for the fetch client.
//!
//! A counting semaphore shared by the requester and receiver roles of one
//! session. The requester waits in `acquire` while `max` requests are
//! unanswered and calls `commit` only once a request is fully sent; the
//! receiver calls `release` after reading the matching response.
//!
//! A response can be read before the requester gets to `commit` the request
//! it answers, so the count may dip to -1 between those two calls.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Returned by `acquire` once the limiter has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterClosed;

impl std::fmt::Display for LimiterClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "limiter closed")
    }
}

impl std::error::Error for LimiterClosed {}

struct State {
    outstanding: isize,
    peak: usize,
    closed: bool,
}

/// Bounds the number of sent-but-unanswered requests.
pub struct OutstandingLimiter {
    state: Mutex<State>,
    released: Condvar,
    max: usize,
}

impl OutstandingLimiter {
    /// Create a limiter admitting at most `max` outstanding requests
    /// (minimum 1).
    pub fn new(max: usize) -> Self {
        Self {
            state: Mutex::new(State {
                outstanding: 0,
                peak: 0,
                closed: false,
            }),
            released: Condvar::new(),
            max: max.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until another request may be sent.
    ///
    /// Does not take the slot; the caller `commit`s after the send succeeds.
    pub fn acquire(&self) -> Result<(), LimiterClosed> {
        let mut state = self.lock();
        // A wakeup is only a hint; re-test before proceeding.
        while state.outstanding >= self.max as isize && !state.closed {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.closed {
            return Err(LimiterClosed);
        }
        Ok(())
    }

    /// Count a request that has been fully sent.
    pub fn commit(&self) {
        let mut state = self.lock();
        debug_assert!(
            state.outstanding < self.max as isize,
            "commit without acquire"
        );
        state.outstanding += 1;
        state.peak = state.peak.max(state.outstanding.max(0) as usize);
    }

    /// Count a response that has been fully read and wake all waiters.
    pub fn release(&self) {
        {
            let mut state = self.lock();
            state.outstanding -= 1;
        }
        self.released.notify_all();
    }

    /// Fail current and future `acquire` calls.
    pub fn close(&self) {
        self.lock().closed = true;
        self.released.notify_all();
    }

    /// Sent-but-unanswered count, briefly -1 if a response beats its commit.
    pub fn outstanding(&self) -> isize {
        self.lock().outstanding
    }

    /// Highest outstanding count observed.
    pub fn peak(&self) -> usize {
        self.lock().peak
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_counts() {
        let limiter = OutstandingLimiter::new(2);

        limiter.acquire().unwrap();
        limiter.commit();
        limiter.acquire().unwrap();
        limiter.commit();
        assert_eq!(limiter.outstanding(), 2);

        limiter.release();
        assert_eq!(limiter.outstanding(), 1);
        assert_eq!(limiter.peak(), 2);
    }

    #[test]
    fn test_acquire_blocks_at_max() {
        let limiter = Arc::new(OutstandingLimiter::new(1));
        limiter.acquire().unwrap();
        limiter.commit();

        let admitted = Arc::new(AtomicBool::new(false));
        let waiter = {
            let limiter = Arc::clone(&limiter);
            let admitted = Arc::clone(&admitted);
            thread::spawn(move || {
                limiter.acquire().unwrap();
                admitted.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!admitted.load(Ordering::SeqCst));

        limiter.release();
        waiter.join().unwrap();
        assert!(admitted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_never_exceeds_max() {
        let max = 3;
        let limiter = Arc::new(OutstandingLimiter::new(max));
        let (tx, rx) = std::sync::mpsc::channel::<()>();

        let requester = {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                for _ in 0..500 {
                    limiter.acquire().unwrap();
                    limiter.commit();
                    assert!(limiter.outstanding() <= max as isize);
                    tx.send(()).unwrap();
                }
            })
        };

        for _ in 0..500 {
            rx.recv().unwrap();
            limiter.release();
        }
        requester.join().unwrap();

        assert_eq!(limiter.outstanding(), 0);
        assert!(limiter.peak() <= max);
    }

    #[test]
    fn test_release_before_commit() {
        let limiter = OutstandingLimiter::new(1);

        for _ in 0..3 {
            limiter.acquire().unwrap();
            limiter.release();
            assert_eq!(limiter.outstanding(), -1);
            limiter.commit();
            assert_eq!(limiter.outstanding(), 0);
        }
        assert_eq!(limiter.peak(), 0);
    }

    #[test]
    fn test_close_wakes_waiter() {
        let limiter = Arc::new(OutstandingLimiter::new(1));
        limiter.acquire().unwrap();
        limiter.commit();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || limiter.acquire())
        };

        thread::sleep(Duration::from_millis(50));
        limiter.close();
        assert_eq!(waiter.join().unwrap(), Err(LimiterClosed));
    }
}
