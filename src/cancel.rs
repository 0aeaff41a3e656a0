use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Polling granularity for cancellable sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum CancelError {
    #[error("operation cancelled: {0}")]
    Cancelled(&'static str),
}

/// Cooperative cancellation shared between the interrupt watcher and the
/// deployment sequence. Both an external interrupt and deadline expiry
/// surface as the same `Cancelled` error.
#[derive(Clone, Debug)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    /// Bounds the whole invocation: expiry is observed at the next checkpoint.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Returns an error when the token was tripped or the deadline elapsed.
    /// Called between every step of the deployment sequence.
    pub fn checkpoint(&self) -> Result<(), CancelError> {
        if self.flag.load(Ordering::SeqCst) {
            return Err(CancelError::Cancelled("interrupt received"));
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(CancelError::Cancelled("timeout elapsed"));
        }

        Ok(())
    }

    /// Sleeps in small slices so a cancellation is observed promptly.
    pub fn sleep(&self, duration: Duration) -> Result<(), CancelError> {
        let wake_at = Instant::now() + duration;
        loop {
            self.checkpoint()?;
            let now = Instant::now();
            if now >= wake_at {
                return Ok(());
            }
            std::thread::sleep(SLEEP_SLICE.min(wake_at - now));
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
