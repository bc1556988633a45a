//! Cancellation and deadline checks for in-flight scans.

use crate::error::{CancelReason, QueryError, Result};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const PAUSE_SLICE: Duration = Duration::from_millis(20);

/// Cancellation token plus an optional deadline, checked on every pull.
#[derive(Debug, Clone)]
pub struct ScanBudget {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl ScanBudget {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A budget that never expires and is never cancelled.
    pub fn unlimited() -> Self {
        Self::new(CancellationToken::new())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Remaining time before the deadline. `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(QueryError::Cancelled(CancelReason::Requested));
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(QueryError::Cancelled(CancelReason::DeadlineExceeded));
        }
        Ok(())
    }

    /// Sleep on the current thread for `duration`, waking early and failing
    /// as soon as the budget runs out.
    pub fn pause(&self, duration: Duration) -> Result<()> {
        let until = Instant::now() + duration;
        loop {
            self.check()?;
            let left = until.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(());
            }
            thread::sleep(left.min(PAUSE_SLICE));
        }
    }
}
