//! Error taxonomy for the log. See spec §7.

use thiserror::Error;

/// Every public operation on [`crate::log::Log`] returns this.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log is closed")]
    ClosedLog,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A backend operation exceeded its deadline. `elapsed` is wall-clock time
    /// spent retrying, `source` is the last transient failure observed.
    #[error("backend unavailable after {elapsed_micros}us: {source}")]
    BackendUnavailable {
        elapsed_micros: u64,
        #[source]
        source: anyhow::Error,
    },

    /// A producer was interrupted while blocked on the bounded send queue
    /// (the async analogue of a Java thread interrupt: the channel closed
    /// out from under the waiting send).
    #[error("interrupted while waiting for queue space")]
    Interrupted,

    #[error("reader failed: {0}")]
    ReaderFailure(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LogError>;
