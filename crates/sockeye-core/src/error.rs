//! Shared error type across sockeye crates.

use thiserror::Error;

/// Shared result type.
pub type Result<T> = std::result::Result<T, SockeyeError>;

/// Unified error type used by the protocol core and the server.
#[derive(Debug, Error)]
pub enum SockeyeError {
    /// The wire packet could not be decoded.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    /// A non-text frame arrived on a text-only transport.
    #[error("binary messages are not supported")]
    BinaryNotSupported,
    /// A zero-length text frame arrived.
    #[error("empty frame")]
    EmptyFrame,
    /// Underlying socket/polling I/O failure.
    #[error("transport i/o: {0}")]
    TransportIo(String),
    /// The HTTP → websocket upgrade could not be completed.
    #[error("upgrade failed: {0}")]
    UpgradeFailed(String),
    /// Request used an HTTP method the endpoint does not accept.
    #[error("method not allowed")]
    MethodNotAllowed,
    /// No channel is registered under the requested sid.
    #[error("connection not found")]
    ConnectionNotFound,
    /// The ack response did not arrive within the caller's deadline.
    #[error("ack timeout")]
    AckTimeout,
    /// The channel shut down while the operation was in flight.
    #[error("channel closed")]
    ChannelClosed,
    /// A write did not complete within the send deadline.
    #[error("write timeout")]
    WriteTimeout,
    /// A read did not complete within the receive deadline.
    #[error("read timeout")]
    ReadTimeout,
    /// Handler registration with an unsupported signature.
    #[error("bad handler shape: {0}")]
    BadHandlerShape(String),
    /// Configuration failed strict parsing or validation.
    #[error("bad config: {0}")]
    BadConfig(String),
}
