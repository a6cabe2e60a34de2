//! Bounded retry for uploads rejected because the remote file is locked.

use crate::error::{SyncError, SyncResult};
use std::time::Duration;

/// Waits between attempts. Tests swap in a recorder so nothing actually sleeps.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails with anything but a lock, or attempts run out.
    /// Exhausting the attempts on a lock yields [`SyncError::Locked`].
    pub fn run<T>(&self, sleeper: &dyn Sleeper, mut op: impl FnMut(u32) -> SyncResult<T>) -> SyncResult<T> {
        let attempts = self.max_attempts.max(1);
        for attempt in 1..=attempts {
            match op(attempt) {
                Err(e) if is_lock(&e) => {
                    tracing::warn!(attempt, max = attempts, "remote file is locked");
                    if attempt < attempts {
                        sleeper.sleep(self.delay);
                    }
                }
                other => return other,
            }
        }
        Err(SyncError::Locked { attempts })
    }
}

/// HTTP 423 (resource locked) in any of its shapes.
pub fn is_lock(error: &SyncError) -> bool {
    matches!(error, SyncError::Locked { .. } | SyncError::Http { status: 423, .. })
}
