//! Transport layer: the multiplexed, encrypted stream connection HTTP/3 runs on.
//!
//! The HTTP/3 engine only sees [`Connection`] and [`Dialer`]. Two
//! implementations ship with the crate:
//! - `quic`: quiche over a UDP socket, driven by a background task
//! - `mem`: an in-process connected pair, used for embedding and tests

pub mod config;
pub mod mem;
pub mod quic;
pub mod stream;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

pub use config::{alpn_for_version, QuicConfig, TlsConfig, QUIC_VERSION_1, QUIC_VERSION_DRAFT_29};
pub use stream::{BidiStream, RecvStream, SendStream, StreamHandle};

/// QUIC stream identifier.
pub type StreamId = u64;

/// Why a connection was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Application error code carried in CONNECTION_CLOSE.
    pub code: u64,
    pub reason: String,
    /// True when the peer closed the connection.
    pub remote: bool,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let by = if self.remote { "peer" } else { "local" };
        if self.reason.is_empty() {
            write!(f, "closed by {} (code 0x{:x})", by, self.code)
        } else {
            write!(f, "closed by {} (code 0x{:x}): {}", by, self.code, self.reason)
        }
    }
}

/// Transport failures.
///
/// Clone so a single dial outcome can be handed to every waiting caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("dial failed: {0}")]
    Dial(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection {0}")]
    Closed(CloseReason),

    #[error("stream {id} reset by peer (code 0x{code:x})")]
    StreamReset { id: StreamId, code: u64 },

    #[error("stream {id} stopped by peer (code 0x{code:x})")]
    StreamStopped { id: StreamId, code: u64 },

    #[error("stream {0} is no longer writable")]
    StreamFinished(StreamId),

    #[error("QUIC error: {0}")]
    Quic(String),

    #[error("transport configuration error: {0}")]
    Config(String),
}

/// Snapshot of the negotiated connection state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub handshake_complete: bool,
    /// Negotiated ALPN, empty before the handshake completes.
    pub alpn: Vec<u8>,
    pub server_name: String,
    /// Leaf certificate presented by the peer (DER).
    pub peer_certificate: Option<Vec<u8>>,
    /// Whether both endpoints negotiated QUIC DATAGRAM frames.
    pub supports_datagrams: bool,
}

/// An established (or establishing) multiplexed connection.
///
/// All methods may be called concurrently from any task.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a bidirectional stream, waiting for stream credit if needed.
    async fn open_bidi_stream(&self) -> Result<BidiStream, TransportError>;

    /// Open a unidirectional (send-only) stream.
    async fn open_uni_stream(&self) -> Result<SendStream, TransportError>;

    async fn accept_bidi_stream(&self) -> Result<BidiStream, TransportError>;

    async fn accept_uni_stream(&self) -> Result<RecvStream, TransportError>;

    /// Resolves once the handshake has completed. Fails if the connection
    /// closes first.
    async fn handshake_complete(&self) -> Result<(), TransportError>;

    /// Close with an application error code. Later calls are no-ops.
    fn close(&self, code: u64, reason: &str);

    /// Resolves when the connection has been closed by either side.
    async fn closed(&self) -> CloseReason;

    fn info(&self) -> ConnectionInfo;
}

/// Establishes connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        authority: &str,
        tls: &TlsConfig,
        quic: &QuicConfig,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

/// Stream-id arithmetic (RFC 9000 Section 2.1).
pub mod stream_id {
    use super::StreamId;

    pub fn is_client_initiated(id: StreamId) -> bool {
        id & 0x1 == 0
    }

    pub fn is_bidi(id: StreamId) -> bool {
        id & 0x2 == 0
    }

    /// The `n`th stream of a kind, counting from 0.
    pub fn nth(n: u64, server: bool, uni: bool) -> StreamId {
        (n << 2) | (u64::from(uni) << 1) | u64::from(server)
    }
}
