//! Error types for the CHAOS transport bridge.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChaosError>;

#[derive(Debug, Error)]
pub enum ChaosError {
    /// The peer rejected the connection attempt or answered the RFC with
    /// something this engine cannot handle. Fatal to the open attempt.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Non-timeout I/O failure on the daemon channel. Once this is returned
    /// the channel must be treated as dead.
    #[error("transport I/O error: {0}")]
    Transport(#[from] std::io::Error),

    /// Frame length inconsistent with the header-declared payload size, or a
    /// field that cannot be interpreted. The receive loop drops such frames;
    /// direct decode callers see the error.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Operation attempted on a connection that has already been torn down.
    #[error("connection closed")]
    ConnectionClosed,
}
