use thiserror::Error;

/// A work request was refused by the underlying reliable transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport refused work request: {reason}")]
pub struct TransportError {
    pub reason: String,
}

impl TransportError {
    pub fn new(reason: impl Into<String>) -> TransportError {
        TransportError {
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the send engine.
///
/// Running out of credits or send buffers is not an error from the caller's perspective: data
///  is buffered locally and retried by the flush logic. Only the very first allocation of an
///  ingest call can surface `OutOfMemory`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("no write space available")]
    WouldBlock,
    #[error("connection was shut down for sending")]
    BrokenPipe,
    #[error("connection is not in a state that allows sending")]
    NotConnected,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("interrupted while waiting for write space")]
    Interrupted,
    #[error(transparent)]
    Io(#[from] TransportError),
    #[error("no send buffer available")]
    OutOfMemory,
    #[error("invalid argument for RDMA write")]
    InvalidArgument,
    #[error("failed to report RDMA write completion")]
    NoDevice,
    #[error("connection cannot send in its current state")]
    InvalidState,
}

impl SendError {
    /// errors that leave the connection in an unusable state, so it is aborted
    pub fn is_fatal(&self) -> bool {
        matches!(self, SendError::Io(_) | SendError::Protocol(_) | SendError::NoDevice)
    }
}
