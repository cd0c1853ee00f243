//! Canonical error type for the multiplexing layer.
//!
//! Ordinary flow control and completion never surface here; they report
//! through status enums and outcome structs. `PipeError` covers the two
//! fault classes that do reach callers: capacity exhaustion and API misuse.

use thiserror::Error;

/// Errors surfaced by [`PipeManager`](crate::manager::PipeManager), pipe
/// readers and pipe writers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipeError {
    /// All 256 local pipe ids of this connection are in use.
    #[error("no free local pipe id; 256 pipes already open on this connection")]
    PipesExhausted,
    /// The pipe has been reset (or never set up) and belongs to no session.
    #[error("pipe is not attached to a session")]
    NotAttached,
    /// The open handshake has not completed, so the pipe has no combined id.
    #[error("pipe has not completed the open handshake")]
    NotReady,
    /// A second logical read was started while one was pending.
    #[error("a read is already pending on this pipe")]
    ReadPending,
    /// A second flush was started while one was pending.
    #[error("a flush is already pending on this pipe")]
    FlushPending,
    /// Bytes were written to a writer that already completed.
    #[error("pipe writer already completed")]
    WriterCompleted,
    /// `advance` positions were non-monotone or past the buffered tail.
    #[error(
        "advance out of range: consumed to {consumed_to}, examined to {examined_to}, tail {tail}"
    )]
    InvalidAdvance {
        consumed_to: u64,
        examined_to: u64,
        tail: u64,
    },
}
