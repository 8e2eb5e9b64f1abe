/// Errors surfaced by the reconnect layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SocketError {
    /// The socket is terminally closed; no further connects are allowed.
    #[error("socket is closed")]
    Closed,

    /// Dialing the transport failed.
    #[error("dial failed: {0}")]
    Dial(String),

    /// Sending a frame on the live transport failed.
    #[error("send failed: {0}")]
    Send(String),
}
