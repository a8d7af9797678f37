//! Error taxonomy for analysis jobs and the worker pool.
//!
//! Job failures carry an explicit kind instead of being inferred from
//! exception strings: recoverable failures consume one retry, permanent
//! failures exhaust the budget, and pool crashes consume none.

use thiserror::Error;

/// Outcome of a single analysis or embedding job.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Consumes one retry; the maintenance pass will re-queue under budget.
    #[error("{0}")]
    Recoverable(String),
    /// Terminally fails the row (retry counter forced to the maximum).
    #[error("{0}")]
    Permanent(String),
}

impl JobError {
    pub fn recoverable(msg: impl Into<String>) -> Self {
        Self::Recoverable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Classify a raw error message: allocation failures are permanent,
    /// everything else is assumed transient.
    pub fn from_message(msg: String) -> Self {
        if is_oom_message(&msg) {
            Self::Permanent(msg)
        } else {
            Self::Recoverable(msg)
        }
    }
}

/// Errors surfaced by the analysis worker pool itself.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker died mid-job; the batch must be re-queued and the pool rebuilt.
    #[error("worker pool crashed: {0}")]
    Crash(String),
    /// The per-batch wall-clock deadline elapsed.
    #[error("batch timeout after {0}s")]
    BatchTimeout(u64),
    #[error("worker pool is shut down")]
    ShutDown,
}

impl PoolError {
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::Crash(_))
    }
}

/// Allocation-failure markers that make a job terminally failed.
pub fn is_oom_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("memoryerror")
        || lower.contains("out of memory")
        || lower.contains("allocation failed")
}

/// Error messages are persisted into a bounded column.
pub fn truncate_error(message: &str) -> String {
    if message.len() <= 500 {
        return message.to_string();
    }
    let mut end = 500;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oom_classification() {
        assert!(JobError::from_message("MemoryError: audio file too large".into()).is_permanent());
        assert!(
            JobError::from_message("buffer allocation failed for frame".into()).is_permanent()
        );
        assert!(!JobError::from_message("decode error: bad packet".into()).is_permanent());
    }

    #[test]
    fn test_truncate_error_bounds() {
        let long = "x".repeat(900);
        assert_eq!(truncate_error(&long).len(), 500);
        assert_eq!(truncate_error("short"), "short");
    }

    #[test]
    fn test_truncate_error_char_boundary() {
        // 2-byte chars straddling the cut point must not split.
        let s = "é".repeat(300);
        let truncated = truncate_error(&s);
        assert!(truncated.len() <= 500);
        assert!(truncated.chars().all(|c| c == 'é'));
    }
}
