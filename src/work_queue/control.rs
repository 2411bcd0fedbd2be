//! Cooperative cancellation and deadlines for running jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::models::{FailureKind, JobError};

/// Shared abort request for one job. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a running stage consults between units of work.
#[derive(Debug, Clone)]
pub struct StageControl {
    cancel: CancelFlag,
    deadline: Instant,
    timeout: Duration,
}

impl StageControl {
    /// Control whose deadline is `timeout` from now.
    pub fn new(cancel: CancelFlag, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `Err` with the terminal job error once the job must stop.
    ///
    /// Cancellation wins over an expired deadline.
    pub fn check(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            return Err(JobError::new(
                FailureKind::Cancelled,
                "cancelled by request",
            ));
        }
        if Instant::now() >= self.deadline {
            return Err(self.timeout_error());
        }
        Ok(())
    }

    pub fn timeout_error(&self) -> JobError {
        JobError::new(
            FailureKind::Timeout,
            format!("processing exceeded {}s", self.timeout.as_secs()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn test_check_reports_cancel_before_timeout() {
        let flag = CancelFlag::new();
        let control = StageControl::new(flag.clone(), Duration::ZERO);
        assert_eq!(control.check().unwrap_err().kind, FailureKind::Timeout);
        flag.cancel();
        assert_eq!(control.check().unwrap_err().kind, FailureKind::Cancelled);
    }

    #[tokio::test]
    async fn test_check_passes_within_deadline() {
        let control = StageControl::new(CancelFlag::new(), Duration::from_secs(60));
        assert!(control.check().is_ok());
    }
}
