//! TLS and QUIC settings handed to a [`Dialer`](super::Dialer).

use std::path::PathBuf;
use std::time::Duration;

/// QUIC version 1 (RFC 9000).
pub const QUIC_VERSION_1: u32 = 0x0000_0001;

/// QUIC draft-29, still spoken by some older deployments.
pub const QUIC_VERSION_DRAFT_29: u32 = 0xff00_001d;

/// ALPN token for HTTP/3 over the given QUIC version.
pub fn alpn_for_version(version: u32) -> Option<&'static str> {
    match version {
        QUIC_VERSION_1 => Some("h3"),
        QUIC_VERSION_DRAFT_29 => Some("h3-29"),
        _ => None,
    }
}

/// TLS settings for the QUIC handshake.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// SNI and verification name. Defaults to the host of the authority.
    pub server_name: Option<String>,
    pub verify_peer: bool,
    /// PEM bundle of trusted roots; the system store is used when unset.
    pub ca_file: Option<PathBuf>,
    /// ALPN protocols offered. The HTTP/3 client overwrites this with the
    /// token matching its QUIC version.
    pub alpn: Vec<String>,
    pub enable_early_data: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            server_name: None,
            verify_peer: true,
            ca_file: None,
            alpn: Vec::new(),
            enable_early_data: false,
        }
    }
}

impl TlsConfig {
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn with_early_data(mut self, enabled: bool) -> Self {
        self.enable_early_data = enabled;
        self
    }
}

/// QUIC transport parameters.
///
/// Flow-control defaults match what Chrome advertises.
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Versions to offer. Empty means QUIC v1; the HTTP/3 client accepts
    /// exactly one.
    pub versions: Vec<u32>,
    pub max_idle_timeout: Duration,
    pub initial_max_data: u64,
    pub initial_max_stream_data: u64,
    /// Bidirectional streams the peer may open towards us.
    pub max_incoming_bidi_streams: u64,
    pub max_incoming_uni_streams: u64,
    pub max_send_udp_payload_size: usize,
    pub enable_datagrams: bool,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            versions: Vec::new(),
            max_idle_timeout: Duration::from_secs(30),
            initial_max_data: 15_663_105,
            initial_max_stream_data: 1_000_000,
            max_incoming_bidi_streams: 0,
            max_incoming_uni_streams: 100,
            max_send_udp_payload_size: 1350,
            enable_datagrams: false,
        }
    }
}

impl QuicConfig {
    pub fn with_versions(mut self, versions: Vec<u32>) -> Self {
        self.versions = versions;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    pub fn with_max_incoming_bidi_streams(mut self, n: u64) -> Self {
        self.max_incoming_bidi_streams = n;
        self
    }

    pub fn with_datagrams(mut self, enabled: bool) -> Self {
        self.enable_datagrams = enabled;
        self
    }
}
