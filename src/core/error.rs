use thiserror::Error;

use crate::core::domain::JobState;

/// Failure kinds the job pipeline distinguishes. Recoverable kinds feed the
/// retry loop; everything else terminates the job on first occurrence.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid job spec: {0}")]
    BadSpec(String),

    #[error("source missing: {0}")]
    SourceMissing(String),

    #[error("encoder failure: {0}")]
    EncoderFailure(String),

    #[error("cancelled")]
    Cancelled,

    #[error("i/o timeout: {0}")]
    IoTimeout(String),

    #[error("upload failed: {0}")]
    UploadFailure(String),

    #[error("a pending job with id {0} already exists")]
    DuplicatePending(String),

    #[error("no such job {0}")]
    NotFound(String),

    #[error("operation not permitted while job is {0}")]
    InvalidState(JobState),

    #[error("executor is shutting down")]
    Shutdown,

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl TaskError {
    /// Whether the retry loop may run another attempt after this error.
    /// Encoder exits and timed-out I/O are transient; spec and input-shape
    /// problems are not, and a cancel must never be retried away.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TaskError::EncoderFailure(_) | TaskError::IoTimeout(_)
        )
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        TaskError::Internal(anyhow::Error::new(err))
    }
}
