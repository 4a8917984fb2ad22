//! HTTP/3 error codes (RFC 9114 Section 8.1) and their escalation scope.

use std::fmt;

/// HTTP/3 application error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum ErrorCode {
    NoError = 0x100,
    GeneralProtocolError = 0x101,
    InternalError = 0x102,
    StreamCreationError = 0x103,
    ClosedCriticalStream = 0x104,
    FrameUnexpected = 0x105,
    FrameError = 0x106,
    ExcessiveLoad = 0x107,
    IdError = 0x108,
    SettingsError = 0x109,
    MissingSettings = 0x10a,
    RequestRejected = 0x10b,
    RequestCancelled = 0x10c,
    RequestIncomplete = 0x10d,
    MessageError = 0x10e,
    ConnectError = 0x10f,
    VersionFallback = 0x110,
}

impl ErrorCode {
    /// Numeric value carried in QUIC RESET_STREAM / STOP_SENDING /
    /// CONNECTION_CLOSE frames.
    pub const fn code(self) -> u64 {
        self as u64
    }

    /// Map a wire value back to a known code.
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0x100 => Self::NoError,
            0x101 => Self::GeneralProtocolError,
            0x102 => Self::InternalError,
            0x103 => Self::StreamCreationError,
            0x104 => Self::ClosedCriticalStream,
            0x105 => Self::FrameUnexpected,
            0x106 => Self::FrameError,
            0x107 => Self::ExcessiveLoad,
            0x108 => Self::IdError,
            0x109 => Self::SettingsError,
            0x10a => Self::MissingSettings,
            0x10b => Self::RequestRejected,
            0x10c => Self::RequestCancelled,
            0x10d => Self::RequestIncomplete,
            0x10e => Self::MessageError,
            0x10f => Self::ConnectError,
            0x110 => Self::VersionFallback,
            _ => return None,
        })
    }

    /// Name as written in RFC 9114.
    pub fn name(self) -> &'static str {
        match self {
            Self::NoError => "H3_NO_ERROR",
            Self::GeneralProtocolError => "H3_GENERAL_PROTOCOL_ERROR",
            Self::InternalError => "H3_INTERNAL_ERROR",
            Self::StreamCreationError => "H3_STREAM_CREATION_ERROR",
            Self::ClosedCriticalStream => "H3_CLOSED_CRITICAL_STREAM",
            Self::FrameUnexpected => "H3_FRAME_UNEXPECTED",
            Self::FrameError => "H3_FRAME_ERROR",
            Self::ExcessiveLoad => "H3_EXCESSIVE_LOAD",
            Self::IdError => "H3_ID_ERROR",
            Self::SettingsError => "H3_SETTINGS_ERROR",
            Self::MissingSettings => "H3_MISSING_SETTINGS",
            Self::RequestRejected => "H3_REQUEST_REJECTED",
            Self::RequestCancelled => "H3_REQUEST_CANCELLED",
            Self::RequestIncomplete => "H3_REQUEST_INCOMPLETE",
            Self::MessageError => "H3_MESSAGE_ERROR",
            Self::ConnectError => "H3_CONNECT_ERROR",
            Self::VersionFallback => "H3_VERSION_FALLBACK",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.code())
    }
}

/// Where a failure is surfaced to the transport.
///
/// Stream-scoped failures abort only the offending stream; connection-scoped
/// failures close the whole QUIC connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Stream(ErrorCode),
    Connection(ErrorCode),
}

impl ErrorScope {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Stream(code) | Self::Connection(code) => *code,
        }
    }
}
