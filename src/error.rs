//! Error types for the specter-h3 crate.

use std::io;

use crate::h3::error::{ErrorCode, ErrorScope};
use crate::h3::frame::FrameError;
use crate::h3::qpack::QpackError;
use crate::transport::TransportError;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during HTTP/3 operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failure confined to one request stream.
    #[error("stream error {code}: {message}")]
    Stream { code: ErrorCode, message: String },

    /// Failure that tears down the whole connection.
    #[error("connection error {code}: {message}")]
    Connection { code: ErrorCode, message: String },

    /// Request sent to a client bound to a different destination.
    #[error("bad authority: client is bound to {expected}, request targets {got}")]
    WrongAuthority { expected: String, got: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// No client exists for the authority and one may not be created.
    #[error("no cached connection for {0}")]
    NoCachedConnection(String),

    #[error("request canceled")]
    Canceled,

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("QPACK error: {0}")]
    Qpack(#[from] QpackError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a stream-scoped error.
    pub fn stream(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Stream {
            code,
            message: message.into(),
        }
    }

    /// Create a connection-scoped error.
    pub fn connection(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Connection {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// How far a failure must be escalated on the wire, if at all.
    pub fn scope(&self) -> Option<ErrorScope> {
        match self {
            Self::Stream { code, .. } => Some(ErrorScope::Stream(*code)),
            Self::Connection { code, .. } => Some(ErrorScope::Connection(*code)),
            _ => None,
        }
    }

    /// The HTTP/3 error code, for scoped errors.
    pub fn code(&self) -> Option<ErrorCode> {
        self.scope().map(|s| s.code())
    }

    /// Human readable part of a scoped error, used as the close reason.
    pub fn message(&self) -> String {
        match self {
            Self::Stream { message, .. } | Self::Connection { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }

    /// Unwrap a transport error carried inside an `io::Error` by the stream
    /// readers.
    pub(crate) fn from_io(err: io::Error) -> Self {
        if err
            .get_ref()
            .is_some_and(|inner| inner.is::<TransportError>())
        {
            if let Some(inner) = err.into_inner() {
                if let Ok(transport) = inner.downcast::<TransportError>() {
                    return Self::Transport(*transport);
                }
            }
            return Self::Io(io::Error::other("transport error"));
        }
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CloseReason;

    #[test]
    fn test_scope_classification() {
        let err = Error::stream(ErrorCode::RequestCancelled, "canceled");
        assert_eq!(
            err.scope(),
            Some(ErrorScope::Stream(ErrorCode::RequestCancelled))
        );

        let err = Error::connection(ErrorCode::FrameUnexpected, "expected HEADERS");
        assert_eq!(
            err.scope(),
            Some(ErrorScope::Connection(ErrorCode::FrameUnexpected))
        );
        assert_eq!(err.message(), "expected HEADERS");

        assert_eq!(Error::Canceled.scope(), None);
        assert_eq!(Error::invalid_request("no host").scope(), None);
    }

    #[test]
    fn test_display() {
        let err = Error::connection(ErrorCode::MissingSettings, "missing SETTINGS");
        assert_eq!(
            err.to_string(),
            "connection error H3_MISSING_SETTINGS (0x10a): missing SETTINGS"
        );
    }

    #[test]
    fn test_from_io_unwraps_transport_error() {
        let reason = CloseReason {
            code: 0x100,
            reason: "bye".into(),
            remote: true,
        };
        let io_err = io::Error::new(
            io::ErrorKind::NotConnected,
            TransportError::Closed(reason.clone()),
        );
        match Error::from_io(io_err) {
            Error::Transport(TransportError::Closed(r)) => assert_eq!(r, reason),
            other => panic!("unexpected {:?}", other),
        }

        let plain = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(Error::from_io(plain), Error::Io(_)));
    }
}
