use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{OmniError, Result};

/// Bounds how long a store scan may run. Clones share the cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct QueryDeadline {
    at: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl QueryDeadline {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn is_expired(&self) -> bool {
        self.is_cancelled() || self.at.is_some_and(|at| Instant::now() >= at)
    }

    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(OmniError::DeadlineExceeded(format!("{operation} cancelled")));
        }
        if self.is_expired() {
            return Err(OmniError::DeadlineExceeded(format!("{operation} timed out")));
        }
        Ok(())
    }
}
