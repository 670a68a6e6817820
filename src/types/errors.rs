//! Error types and error classes.
//!
//! Every error carries a class tag (`ErrorClass`) so callers can ask "is this
//! a protocol error?" without matching on the concrete variant. Classes travel
//! across the wire inside `Error` frames, so a remote handler's failure keeps
//! its classification on the calling side.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an error.
///
/// `Error` is the top-level class: every error is a member of it. `Internal`
/// and `Protocol` are the specific classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Generic muxrpc error; used when no more specific class applies.
    Error,
    /// Local fault not caused by the peer or the wire.
    Internal,
    /// Violation of the framing or multiplexing contract.
    Protocol,
}

impl ErrorClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Error => "muxrpc",
            ErrorClass::Internal => "internal error",
            ErrorClass::Protocol => "protocol error",
        }
    }

    /// Wire code used in `Error` frame payloads.
    pub(crate) const fn code(self) -> u8 {
        match self {
            ErrorClass::Error => 0,
            ErrorClass::Internal => 1,
            ErrorClass::Protocol => 2,
        }
    }

    pub(crate) const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ErrorClass::Error),
            1 => Some(ErrorClass::Internal),
            2 => Some(ErrorClass::Protocol),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error enum for muxrpc.
///
/// Cloneable so a single teardown cause can be handed to every stream of a
/// connection.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Framing or multiplexing contract violation (class `Protocol`).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local invariant violation (class `Internal`).
    #[error("internal error: {0}")]
    Internal(String),

    /// The stream or call was canceled locally.
    #[error("canceled: {0}")]
    Canceled(String),

    /// The connection is gone.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The peer closed its send side and every message has been received.
    #[error("end of stream")]
    EndOfStream,

    /// Error reported by the peer in an `Error` frame.
    #[error("remote {class}: {message}")]
    Remote { class: ErrorClass, message: String },

    /// Message encoding/decoding errors (class `Internal`).
    #[error("serialization error: {0}")]
    Serialization(#[source] Arc<serde_json::Error>),

    /// Transport I/O errors.
    #[error("io error: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

impl Error {
    /// The most specific class this error belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Protocol(_) => ErrorClass::Protocol,
            Error::Internal(_) | Error::Serialization(_) => ErrorClass::Internal,
            Error::Remote { class, .. } => *class,
            Error::Canceled(_)
            | Error::ConnectionClosed(_)
            | Error::EndOfStream
            | Error::Io(_) => ErrorClass::Error,
        }
    }

    /// Class membership test. Every error is a member of `ErrorClass::Error`.
    pub fn is(&self, class: ErrorClass) -> bool {
        class == ErrorClass::Error || self.class() == class
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Error::EndOfStream)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled(_) | Error::ConnectionClosed(_))
    }

    /// Message sent to the peer in an `Error` frame.
    pub(crate) fn wire_message(&self) -> String {
        match self {
            Error::Protocol(msg) | Error::Internal(msg) | Error::Canceled(msg) => msg.clone(),
            Error::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

// Convenience constructors
impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn canceled(msg: impl Into<String>) -> Self {
        Self::Canceled(msg.into())
    }

    pub fn connection_closed(msg: impl Into<String>) -> Self {
        Self::ConnectionClosed(msg.into())
    }

    pub fn remote(class: ErrorClass, message: impl Into<String>) -> Self {
        Self::Remote {
            class,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(err))
    }
}
