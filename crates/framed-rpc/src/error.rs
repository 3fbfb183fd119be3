//! Error types for the RPC transport.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-related errors.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Protocol-level errors.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Codec errors during serialization/deserialization.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Handler errors from the server side.
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Error text returned by the remote peer for a call.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Call deadline expired before a response arrived.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Generic I/O error from the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Connection-specific errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connection closed, either by the peer or by a local stream failure.
    #[error("Connection closed")]
    Closed,

    /// The client was shut down locally and accepts no new calls.
    #[error("Client is shutting down")]
    ShuttingDown,
}

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame too large.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization of envelope bytes failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),

    /// A decoded value does not fit the type the caller asked for.
    #[error("Cannot coerce value into {target}: {reason}")]
    Coercion {
        /// Name of the destination type.
        target: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Handler errors from server-side processing.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// No handler registered under the requested name.
    #[error("method not found: {0}")]
    NotFound(String),

    /// The requested name is not of the form `Type.Method`.
    #[error("service/method request ill-formed: {0}")]
    IllFormed(String),

    /// A handler is already registered under this name.
    #[error("method already registered: {0}")]
    Duplicate(String),

    /// Handler panicked while processing a call.
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Handler returned a business error.
    #[error("{0}")]
    Internal(String),
}

impl From<ciborium::de::Error<io::Error>> for CodecError {
    fn from(err: ciborium::de::Error<io::Error>) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for CodecError {
    fn from(err: ciborium::ser::Error<io::Error>) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}
