//! HTTP/3 client options.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::h3::dispatcher::StreamType;
use crate::h3::frame::{FrameType, Hijack, Settings, SETTING_H3_DATAGRAM};
use crate::transport::{BidiStream, Connection, RecvStream};

/// Response header budget used when none is configured (10 MiB).
pub const DEFAULT_MAX_RESPONSE_HEADER_BYTES: u64 = 10 * 1024 * 1024;

/// Claims a peer-initiated bidirectional stream whose first frame type is
/// unknown. Return [`Hijack::Declined`] to hand the stream back.
pub type StreamHijacker = Arc<
    dyn Fn(FrameType, Arc<dyn Connection>, BidiStream) -> Result<Hijack<BidiStream>> + Send + Sync,
>;

/// Claims a peer-initiated unidirectional stream of an unknown type.
pub type UniStreamHijacker = Arc<
    dyn Fn(StreamType, Arc<dyn Connection>, RecvStream) -> Result<Hijack<RecvStream>>
        + Send
        + Sync,
>;

/// Protocol options for a [`Client`](crate::h3::client::Client).
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Never request transparent gzip.
    pub disable_compression: bool,
    /// Advertise HTTP/3 datagram support and require it from the transport.
    pub enable_datagrams: bool,
    /// Largest HEADERS frame accepted. `None` or `Some(0)` selects
    /// [`DEFAULT_MAX_RESPONSE_HEADER_BYTES`].
    pub max_response_header_bytes: Option<u64>,
    /// Extra SETTINGS sent on the control stream. The datagram id (0x33) is
    /// never sent from here; see [`ClientOptions::local_settings`].
    pub additional_settings: BTreeMap<u64, u64>,
    pub stream_hijacker: Option<StreamHijacker>,
    pub uni_stream_hijacker: Option<UniStreamHijacker>,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("disable_compression", &self.disable_compression)
            .field("enable_datagrams", &self.enable_datagrams)
            .field("max_response_header_bytes", &self.max_response_header_bytes)
            .field("additional_settings", &self.additional_settings)
            .field("stream_hijacker", &self.stream_hijacker.is_some())
            .field("uni_stream_hijacker", &self.uni_stream_hijacker.is_some())
            .finish()
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.disable_compression = !enabled;
        self
    }

    pub fn with_datagrams(mut self, enabled: bool) -> Self {
        self.enable_datagrams = enabled;
        self
    }

    pub fn with_max_response_header_bytes(mut self, max: u64) -> Self {
        self.max_response_header_bytes = Some(max);
        self
    }

    pub fn with_setting(mut self, id: u64, value: u64) -> Self {
        self.additional_settings.insert(id, value);
        self
    }

    /// SETTINGS advertised on the control stream. Datagram support follows
    /// `enable_datagrams` only, whatever `additional_settings` holds.
    pub fn local_settings(&self) -> Settings {
        let mut extensions = self.additional_settings.clone();
        extensions.remove(&SETTING_H3_DATAGRAM);
        Settings {
            datagram: self.enable_datagrams,
            extensions,
        }
    }

    pub fn with_stream_hijacker<F>(mut self, hijacker: F) -> Self
    where
        F: Fn(FrameType, Arc<dyn Connection>, BidiStream) -> Result<Hijack<BidiStream>>
            + Send
            + Sync
            + 'static,
    {
        self.stream_hijacker = Some(Arc::new(hijacker));
        self
    }

    pub fn with_uni_stream_hijacker<F>(mut self, hijacker: F) -> Self
    where
        F: Fn(StreamType, Arc<dyn Connection>, RecvStream) -> Result<Hijack<RecvStream>>
            + Send
            + Sync
            + 'static,
    {
        self.uni_stream_hijacker = Some(Arc::new(hijacker));
        self
    }

    /// Effective HEADERS budget.
    pub fn max_header_bytes(&self) -> u64 {
        match self.max_response_header_bytes {
            None | Some(0) => DEFAULT_MAX_RESPONSE_HEADER_BYTES,
            Some(max) => max,
        }
    }
}
