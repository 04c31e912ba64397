use std::io;

use thiserror::Error;

/// The error surface of the engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The submission queue has no room for the requested operations.
    ///
    /// The queue drains as the reapers publish entries to the kernel;
    /// retry after completions have been consumed.
    #[error("submission queue is full")]
    SubmissionQueueFull,

    /// The kernel dropped completion events because the completion queue
    /// was not drained in time. Pending callbacks may never fire; the ring
    /// is unusable.
    #[error("completion queue overflowed")]
    CompletionQueueOverflow,

    /// The ring has been shut down.
    #[error("ring has been disposed")]
    Disposed,

    /// A syscall failed.
    #[error(transparent)]
    Os(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
