//! HTTP/3 frame codec (RFC 9114 Section 7).
//!
//! Every frame on every stream is `varint(type) varint(length) payload`.
//! Only SETTINGS payloads are decoded here; DATA and HEADERS are returned as
//! headers so the caller can read the payload itself with a length it has
//! already checked. Frame types this client does not act on are skipped and
//! reported as [`Frame::Unknown`].

use std::collections::BTreeMap;
use std::io;

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::varint;

/// Reserved SETTINGS id advertising HTTP Datagram support (RFC 9297).
pub const SETTING_H3_DATAGRAM: u64 = 0x33;

/// Largest SETTINGS payload accepted from a peer.
pub const MAX_SETTINGS_LEN: u64 = 8 * 1024;

/// Frame type identifiers defined by RFC 9114.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Data,
    Headers,
    CancelPush,
    Settings,
    PushPromise,
    GoAway,
    MaxPushId,
    Unknown(u64),
}

impl From<u64> for FrameType {
    fn from(v: u64) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x3 => Self::CancelPush,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x7 => Self::GoAway,
            0xd => Self::MaxPushId,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u64 {
    fn from(ft: FrameType) -> u64 {
        match ft {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::CancelPush => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::GoAway => 0x7,
            FrameType::MaxPushId => 0xd,
            FrameType::Unknown(v) => v,
        }
    }
}

/// Errors raised while reading a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame read failed: {0}")]
    Io(#[from] io::Error),

    #[error("SETTINGS frame too large: {0} bytes")]
    SettingsTooLarge(u64),

    #[error("malformed {frame_type:?} frame: {reason}")]
    Malformed {
        frame_type: FrameType,
        reason: &'static str,
    },
}

/// Settings exchanged on the control stream.
///
/// `extensions` holds every id other than the datagram one, plus the datagram
/// id itself when the peer sent it with a value other than 1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub datagram: bool,
    pub extensions: BTreeMap<u64, u64>,
}

impl Settings {
    /// Decode a SETTINGS payload. Repeated ids keep the last value seen.
    pub fn decode(mut payload: &[u8]) -> Result<Self, FrameError> {
        let mut settings = Settings::default();
        while !payload.is_empty() {
            let (id, n) = varint::decode(payload).ok_or(FrameError::Malformed {
                frame_type: FrameType::Settings,
                reason: "truncated setting id",
            })?;
            payload = &payload[n..];
            let (value, n) = varint::decode(payload).ok_or(FrameError::Malformed {
                frame_type: FrameType::Settings,
                reason: "truncated setting value",
            })?;
            payload = &payload[n..];

            if id == SETTING_H3_DATAGRAM {
                settings.datagram = value == 1;
                if settings.datagram {
                    settings.extensions.remove(&id);
                } else {
                    settings.extensions.insert(id, value);
                }
            } else {
                settings.extensions.insert(id, value);
            }
        }
        Ok(settings)
    }

    fn payload_len(&self) -> usize {
        let mut len = 0;
        if self.datagram {
            len += varint::encoded_len(SETTING_H3_DATAGRAM) + varint::encoded_len(1);
        }
        for (&id, &value) in self.entries() {
            len += varint::encoded_len(id) + varint::encoded_len(value);
        }
        len
    }

    // Extension entries that do not collide with the datagram flag.
    fn entries(&self) -> impl Iterator<Item = (&u64, &u64)> {
        let datagram = self.datagram;
        self.extensions
            .iter()
            .filter(move |(id, _)| !(datagram && **id == SETTING_H3_DATAGRAM))
    }

    /// Append a complete SETTINGS frame to `buf`.
    pub fn encode_frame<B: BufMut>(&self, buf: &mut B) {
        encode_frame_header(buf, FrameType::Settings, self.payload_len() as u64);
        if self.datagram {
            varint::encode(SETTING_H3_DATAGRAM, buf);
            varint::encode(1, buf);
        }
        for (&id, &value) in self.entries() {
            varint::encode(id, buf);
            varint::encode(value, buf);
        }
    }
}

/// A decoded frame header, or a fully decoded SETTINGS frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// DATA frame; `length` payload bytes follow on the stream.
    Data { length: u64 },
    /// HEADERS frame; `length` bytes of QPACK field section follow.
    Headers { length: u64 },
    Settings(Settings),
    /// A frame this client ignores. Its payload has already been skipped.
    Unknown { frame_type: FrameType, length: u64 },
}

/// Verdict of an unknown-frame or unknown-stream callback.
pub enum Hijack<S> {
    /// The callback took ownership of the stream.
    Taken,
    /// The callback passed; default processing continues on the stream.
    Declined(S),
}

/// Result of [`read_frame_or_hijack`].
pub enum FrameOutcome<S> {
    Frame(Frame, S),
    Hijacked,
}

pub fn encode_frame_header<B: BufMut>(buf: &mut B, frame_type: FrameType, length: u64) {
    varint::encode(frame_type.into(), buf);
    varint::encode(length, buf);
}

pub fn encode_frame<B: BufMut>(buf: &mut B, frame_type: FrameType, payload: &[u8]) {
    encode_frame_header(buf, frame_type, payload.len() as u64);
    buf.put_slice(payload);
}

/// Read the next frame from `reader`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let frame_type = FrameType::from(varint::read(reader).await?);
    read_frame_body(reader, frame_type).await
}

/// Read the next frame, offering frames of unknown type to `on_unknown`
/// before their length is consumed.
///
/// If the callback takes the stream the outcome is [`FrameOutcome::Hijacked`]
/// and the caller must stop touching it. Known frame types never reach the
/// callback.
pub async fn read_frame_or_hijack<S, F, E>(mut stream: S, on_unknown: F) -> Result<FrameOutcome<S>, E>
where
    S: AsyncRead + Unpin,
    F: FnOnce(FrameType, S) -> Result<Hijack<S>, E>,
    E: From<FrameError>,
{
    let raw = varint::read(&mut stream).await.map_err(FrameError::from)?;
    let frame_type = FrameType::from(raw);
    if let FrameType::Unknown(_) = frame_type {
        match on_unknown(frame_type, stream)? {
            Hijack::Taken => return Ok(FrameOutcome::Hijacked),
            Hijack::Declined(s) => stream = s,
        }
    }
    let frame = read_frame_body(&mut stream, frame_type).await?;
    Ok(FrameOutcome::Frame(frame, stream))
}

async fn read_frame_body<R>(reader: &mut R, frame_type: FrameType) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let length = varint::read(reader).await?;
    match frame_type {
        FrameType::Data => Ok(Frame::Data { length }),
        FrameType::Headers => Ok(Frame::Headers { length }),
        FrameType::Settings => {
            if length > MAX_SETTINGS_LEN {
                return Err(FrameError::SettingsTooLarge(length));
            }
            let mut payload = vec![0u8; length as usize];
            reader.read_exact(&mut payload).await?;
            Ok(Frame::Settings(Settings::decode(&payload)?))
        }
        other => {
            skip(reader, length).await?;
            Ok(Frame::Unknown {
                frame_type: other,
                length,
            })
        }
    }
}

/// Discard exactly `length` bytes.
pub(crate) async fn skip<R>(reader: &mut R, length: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let copied = tokio::io::copy(&mut reader.take(length), &mut tokio::io::sink()).await?;
    if copied < length {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream ended inside frame payload",
        ));
    }
    Ok(())
}
