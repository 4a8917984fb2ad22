//! Dispatch of peer-initiated streams.
//!
//! Unidirectional streams are classified by their leading stream type:
//!
//! | Type          | Handling                                              |
//! |---------------|-------------------------------------------------------|
//! | control       | SETTINGS first, then drained for the connection life  |
//! | QPACK enc/dec | accepted and left unread (no dynamic table)           |
//! | push          | H3_ID_ERROR, push is never enabled                    |
//! | unknown       | uni hijacker, else STOP_SENDING H3_STREAM_CREATION_ERROR |
//!
//! Bidirectional streams are only accepted when a stream hijacker is set;
//! any frame it does not claim closes the connection with
//! H3_FRAME_UNEXPECTED.

use std::io;
use std::sync::Arc;

use crate::config::{StreamHijacker, UniStreamHijacker};
use crate::h3::error::ErrorCode;
use crate::h3::frame::{self, Frame, FrameError, FrameOutcome, Hijack};
use crate::h3::varint;
use crate::transport::{BidiStream, Connection, RecvStream};

/// Leading type of a unidirectional stream (RFC 9114 Section 6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Control,
    Push,
    QpackEncoder,
    QpackDecoder,
    Unknown(u64),
}

impl From<u64> for StreamType {
    fn from(v: u64) -> Self {
        match v {
            0x0 => StreamType::Control,
            0x1 => StreamType::Push,
            0x2 => StreamType::QpackEncoder,
            0x3 => StreamType::QpackDecoder,
            other => StreamType::Unknown(other),
        }
    }
}

impl From<StreamType> for u64 {
    fn from(t: StreamType) -> u64 {
        match t {
            StreamType::Control => 0x0,
            StreamType::Push => 0x1,
            StreamType::QpackEncoder => 0x2,
            StreamType::QpackDecoder => 0x3,
            StreamType::Unknown(v) => v,
        }
    }
}

/// Consumes the streams a peer opens on one connection.
pub(crate) struct Dispatcher {
    conn: Arc<dyn Connection>,
    enable_datagrams: bool,
    stream_hijacker: Option<StreamHijacker>,
    uni_stream_hijacker: Option<UniStreamHijacker>,
}

impl Dispatcher {
    pub(crate) fn new(
        conn: Arc<dyn Connection>,
        enable_datagrams: bool,
        stream_hijacker: Option<StreamHijacker>,
        uni_stream_hijacker: Option<UniStreamHijacker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn,
            enable_datagrams,
            stream_hijacker,
            uni_stream_hijacker,
        })
    }

    /// Start the accept loops. The bidirectional loop only runs with a
    /// stream hijacker configured.
    pub(crate) fn spawn(self: &Arc<Self>) {
        tokio::spawn(Arc::clone(self).accept_uni_loop());
        if self.stream_hijacker.is_some() {
            tokio::spawn(Arc::clone(self).accept_bidi_loop());
        }
    }

    fn close(&self, code: ErrorCode, reason: &str) {
        tracing::debug!(%code, reason, "closing HTTP/3 connection");
        self.conn.close(code.code(), reason);
    }

    async fn accept_uni_loop(self: Arc<Self>) {
        loop {
            match self.conn.accept_uni_stream().await {
                Ok(stream) => {
                    tokio::spawn(Arc::clone(&self).handle_uni(stream));
                }
                Err(e) => {
                    tracing::debug!("accepting unidirectional stream failed: {}", e);
                    return;
                }
            }
        }
    }

    async fn accept_bidi_loop(self: Arc<Self>) {
        loop {
            match self.conn.accept_bidi_stream().await {
                Ok(stream) => {
                    tokio::spawn(Arc::clone(&self).handle_bidi(stream));
                }
                Err(e) => {
                    tracing::debug!("accepting bidirectional stream failed: {}", e);
                    return;
                }
            }
        }
    }

    async fn handle_uni(self: Arc<Self>, mut stream: RecvStream) {
        let stream_type = match varint::read(&mut stream).await {
            Ok(v) => StreamType::from(v),
            Err(e) => {
                tracing::debug!(stream = stream.id(), "reading stream type failed: {}", e);
                return;
            }
        };

        match stream_type {
            StreamType::Control => self.handle_control(stream).await,
            // The dynamic table is never used, so these carry nothing we need.
            StreamType::QpackEncoder | StreamType::QpackDecoder => {}
            StreamType::Push => self.close(ErrorCode::IdError, "received push stream"),
            StreamType::Unknown(_) => {
                if let Some(hijacker) = &self.uni_stream_hijacker {
                    let handle = stream.handle();
                    match hijacker(stream_type, Arc::clone(&self.conn), stream) {
                        Ok(Hijack::Taken) => return,
                        Ok(Hijack::Declined(s)) => stream = s,
                        Err(e) => {
                            tracing::debug!(stream = handle.id(), "uni stream hijacker failed: {}", e);
                            handle.cancel_read(ErrorCode::StreamCreationError.code());
                            return;
                        }
                    }
                }
                stream.cancel_read(ErrorCode::StreamCreationError.code());
            }
        }
    }

    async fn handle_control(&self, mut stream: RecvStream) {
        let settings = match frame::read_frame(&mut stream).await {
            Ok(Frame::Settings(settings)) => settings,
            Ok(_) => {
                self.close(ErrorCode::MissingSettings, "expected SETTINGS frame");
                return;
            }
            Err(e) => {
                self.close(ErrorCode::FrameError, &e.to_string());
                return;
            }
        };
        tracing::debug!(?settings, "received peer SETTINGS");

        if settings.datagram && self.enable_datagrams {
            // 0-RTT can deliver SETTINGS before the transport knows what it negotiated
            if let Err(e) = self.conn.handshake_complete().await {
                tracing::debug!("handshake failed before SETTINGS check: {}", e);
                return;
            }
            if !self.conn.info().supports_datagrams {
                self.close(ErrorCode::SettingsError, "missing QUIC Datagram support");
                return;
            }
        }

        loop {
            match frame::read_frame(&mut stream).await {
                Ok(Frame::Unknown { frame_type, .. }) => {
                    tracing::trace!(?frame_type, "ignoring control frame");
                }
                Ok(Frame::Settings(_)) => {
                    self.close(ErrorCode::FrameUnexpected, "duplicate SETTINGS frame");
                    return;
                }
                Ok(Frame::Data { .. }) | Ok(Frame::Headers { .. }) => {
                    self.close(ErrorCode::FrameUnexpected, "unexpected frame on control stream");
                    return;
                }
                Err(FrameError::Io(e)) if is_stream_end(&e) => {
                    self.close(ErrorCode::ClosedCriticalStream, "control stream closed");
                    return;
                }
                Err(FrameError::Io(e)) => {
                    tracing::debug!("control stream read ended: {}", e);
                    return;
                }
                Err(e) => {
                    self.close(ErrorCode::FrameError, &e.to_string());
                    return;
                }
            }
        }
    }

    async fn handle_bidi(self: Arc<Self>, stream: BidiStream) {
        let Some(hijacker) = self.stream_hijacker.clone() else {
            return;
        };
        let id = stream.id();
        let conn = Arc::clone(&self.conn);
        let outcome = frame::read_frame_or_hijack(stream, |frame_type, stream| {
            hijacker(frame_type, conn, stream)
        })
        .await;

        match outcome {
            Ok(FrameOutcome::Hijacked) => {}
            Ok(FrameOutcome::Frame(frame, _)) => {
                tracing::debug!(stream = id, ?frame, "unclaimed frame on bidirectional stream");
                self.close(
                    ErrorCode::FrameUnexpected,
                    "received HTTP/3 frame on bidirectional stream",
                );
            }
            Err(e) => {
                tracing::debug!(stream = id, "reading bidirectional stream failed: {}", e);
                self.close(
                    ErrorCode::FrameUnexpected,
                    "received HTTP/3 frame on bidirectional stream",
                );
            }
        }
    }
}

/// Peer finished or reset the stream, as opposed to the connection going away.
fn is_stream_end(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
    )
}
