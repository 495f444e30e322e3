/// The main error type for millrace queues
#[derive(Debug, thiserror::Error)]
pub enum MillraceError {
    /// Returned by `start` once a graceful shutdown has begun.
    #[error("queue is shutting down or closed")]
    QueueClosed,

    /// A reserved job was already past its maximum attempt count before
    /// execution began (poisoned or hand-edited entries).
    #[error("job exceeded its maximum execute attempts")]
    MaxAttemptsExceeded,

    /// A duplicate reservation was re-scheduled because the previous run of
    /// the same job has not returned yet.
    #[error("aborted while waiting for the previous run of this job to finish")]
    WaitingPrevJobFinish,

    /// A by-name operation referenced a task that was never bootstrapped.
    #[error("task {0} is not bootstrapped")]
    TaskNotRegistered(String),

    /// An attempt deadline or a shutdown deadline elapsed.
    #[error("deadline elapsed")]
    DeadlineExceeded,

    /// Task code panicked during an attempt. The panic is confined to the
    /// attempt; retry rules still apply.
    #[error("job execution panicked: {0}")]
    Panic(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MillraceError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn task_not_registered(name: impl Into<String>) -> Self {
        Self::TaskNotRegistered(name.into())
    }
}

/// Result type alias for millrace operations
pub type Result<T> = std::result::Result<T, MillraceError>;
