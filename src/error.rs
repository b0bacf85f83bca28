use thiserror::Error;

/// Convenient type alias for `Result<T, QmuxError>`.
pub type Result<T> = std::result::Result<T, QmuxError>;

/// Error types for the qmux library.
///
/// `QmuxError` represents all error conditions raised by the stream table
/// and the flow controllers, from protocol violations by the peer to local
/// accounting misuse. The enum is `Clone` so that a terminal error registered
/// with `StreamsMap::close_with_error` can be handed verbatim to every
/// suspended caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QmuxError {
    /// The peer referenced a stream ID it is not allowed to open: wrong
    /// parity for its role, or an ID below one it already skipped over.
    #[error("invalid stream ID: {0}")]
    InvalidStreamId(u64),

    /// Opening one more stream would exceed the configured limit for its
    /// direction.
    #[error("too many open streams")]
    TooManyOpenStreams,

    /// The peer sent data beyond a granted receive window, or announced an
    /// inconsistent final offset. Connection-fatal.
    #[error("flow control violation: {0}")]
    FlowControl(String),

    /// Local accounting bug: more bytes were recorded as sent than the peer
    /// ever granted. Never caused by the peer.
    #[error("send budget exceeded: sent {sent} bytes, window is {window}")]
    SendBudgetExceeded { sent: u64, window: u64 },

    /// The stream table was closed; carries the registered terminal error
    /// message.
    #[error("stream table closed: {0}")]
    Closed(String),

    /// Write on a stream whose send side was already closed.
    #[error("stream {0} send side closed")]
    SendClosed(u64),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The ordered stream list and the stream map drifted apart. Always a
    /// local bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl QmuxError {
    /// Whether the caller may retry the operation that produced this error.
    ///
    /// `TooManyOpenStreams` is recoverable for explicit opens (capacity
    /// frees up when a stream closes); protocol violations and terminal
    /// errors are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            QmuxError::TooManyOpenStreams => true,
            QmuxError::InvalidStreamId(_)
            | QmuxError::FlowControl(_)
            | QmuxError::SendBudgetExceeded { .. }
            | QmuxError::Closed(_)
            | QmuxError::SendClosed(_)
            | QmuxError::Config(_)
            | QmuxError::Internal(_) => false,
        }
    }

    /// Whether this error reports a protocol violation by the peer, as
    /// opposed to local misuse or a local shutdown.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            QmuxError::InvalidStreamId(_) | QmuxError::FlowControl(_)
        )
    }
}
