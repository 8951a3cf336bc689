use crate::frame::FrameError;

/// Errors raised by the message-bus layer.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Failed to open the underlying transport.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker answered the STOMP handshake with an `ERROR` frame.
    #[error("Handshake rejected: {0}")]
    Handshake(String),

    /// The broker sent something other than a valid STOMP frame.
    #[error("Protocol error: {0}")]
    Protocol(#[from] FrameError),

    /// No link is attached, so nothing can be subscribed.
    #[error("Message bus not connected")]
    NotConnected,

    /// The link task has exited and no longer accepts commands.
    #[error("Message bus link closed")]
    LinkClosed,

    /// No subscription exists for the given job id.
    #[error("No subscription for job {0}")]
    NotSubscribed(String),
}
