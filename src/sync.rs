//! Backend wakeup primitive.
//!
//! A counting semaphore: every `signal()` is delivered to exactly one
//! `wait()`, signals are never merged, and `shutdown()` releases every
//! waiter, present and future, with [`Cancelled`].

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use thiserror::Error;

/// The semaphore was shut down while (or before) waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wait cancelled by shutdown")]
pub struct Cancelled;

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Signaled,
    TimedOut,
}

struct SemState {
    count: u64,
    shutdown: bool,
}

pub struct Semaphore {
    state: Mutex<SemState>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SemState { count: 0, shutdown: false }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Post one wakeup. Ignored after shutdown.
    pub fn signal(&self) {
        let mut state = self.lock();
        if state.shutdown {
            return;
        }
        state.count += 1;
        drop(state);
        self.cond.notify_one();
    }

    /// Consume a pending wakeup without blocking.
    pub fn try_wait(&self) -> Result<bool, Cancelled> {
        let mut state = self.lock();
        if state.shutdown {
            return Err(Cancelled);
        }
        if state.count > 0 {
            state.count -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    /// Block until a wakeup is available or the semaphore is shut down.
    pub fn wait(&self) -> Result<(), Cancelled> {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return Err(Cancelled);
            }
            if state.count > 0 {
                state.count -= 1;
                return Ok(());
            }
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait`](Self::wait) but gives up at `deadline`.
    pub fn wait_until(&self, deadline: Instant) -> Result<Wake, Cancelled> {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return Err(Cancelled);
            }
            if state.count > 0 {
                state.count -= 1;
                return Ok(Wake::Signaled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Wake::TimedOut);
            }
            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Wake every waiter with `Cancelled`; later waits fail immediately.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.cond.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shutdown
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_signals_are_counted() {
        let sem = Semaphore::new();
        sem.signal();
        sem.signal();
        assert_eq!(sem.try_wait(), Ok(true));
        assert_eq!(sem.wait(), Ok(()));
        assert_eq!(sem.try_wait(), Ok(false));
    }

    #[test]
    fn test_wait_until_times_out() {
        let sem = Semaphore::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(sem.wait_until(deadline), Ok(Wake::TimedOut));
        sem.signal();
        assert_eq!(sem.wait_until(deadline), Ok(Wake::Signaled));
    }

    #[test]
    fn test_shutdown_releases_waiters() {
        let sem = Arc::new(Semaphore::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let sem = Arc::clone(&sem);
                thread::spawn(move || sem.wait())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        sem.shutdown();
        for w in waiters {
            assert_eq!(w.join().unwrap(), Err(Cancelled));
        }
        sem.signal();
        assert_eq!(sem.wait(), Err(Cancelled));
        assert!(sem.is_shut_down());
    }

    #[test]
    fn test_wakeup_crosses_threads() {
        let sem = Arc::new(Semaphore::new());
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait_until(Instant::now() + Duration::from_secs(5)))
        };
        sem.signal();
        assert_eq!(waiter.join().unwrap(), Ok(Wake::Signaled));
    }
}
