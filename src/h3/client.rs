//! HTTP/3 client bound to one destination.
//!
//! The transport connection is dialed lazily, exactly once, by the first
//! round trip. Every caller awaits the same dial outcome. Once connected the
//! client opens its control stream and starts the [`Dispatcher`] for
//! peer-initiated streams.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::BytesMut;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::request::Parts;
use http::uri::Authority;
use http::{Method, Request, StatusCode};
use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, watch};

use crate::config::ClientOptions;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::h3::body::{Body, ResponseBody};
use crate::h3::dispatcher::{Dispatcher, StreamType};
use crate::h3::error::{ErrorCode, ErrorScope};
use crate::h3::frame::{self, Frame, Settings};
use crate::h3::qpack::{Decoder, Encoder, HeaderField};
use crate::h3::request::{self, RequestBody};
use crate::h3::varint;
use crate::response::{ContentLength, Response};
use crate::transport::quic::QuicheDialer;
use crate::transport::{
    alpn_for_version, BidiStream, Connection, Dialer, QuicConfig, RecvStream, StreamHandle,
    TlsConfig, TransportError, QUIC_VERSION_1,
};

/// Method that marks a GET to be sent as 0-RTT early data.
pub const METHOD_GET_0RTT: &str = "GET_0RTT";

/// Peer-initiated bidirectional streams allowed when a stream hijacker is
/// configured and the QUIC config leaves the limit at 0.
const HIJACK_BIDI_STREAMS: u64 = 100;

const DEFAULT_HTTPS_PORT: u16 = 443;

type DialOutcome = std::result::Result<Arc<dyn Connection>, TransportError>;

/// `host:port` form of an authority, adding the HTTPS port when missing.
pub fn authority_addr(authority: &str) -> String {
    match authority.parse::<Authority>() {
        Ok(parsed) if parsed.port_u16().is_some() => parsed.as_str().to_string(),
        Ok(parsed) => format!("{}:{}", parsed.host(), DEFAULT_HTTPS_PORT),
        Err(_) => format!("{}:{}", authority, DEFAULT_HTTPS_PORT),
    }
}

/// Authority a request targets: the URI authority, else the Host header.
pub(crate) fn request_authority(parts: &Parts) -> Option<String> {
    if let Some(authority) = parts.uri.authority() {
        return Some(authority.as_str().to_string());
    }
    parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
}

/// HTTP/3 client for one `host:port`.
pub struct Client {
    authority: String,
    tls: TlsConfig,
    quic: QuicConfig,
    opts: ClientOptions,
    dialer: Arc<dyn Dialer>,
    dial: OnceLock<watch::Receiver<Option<DialOutcome>>>,
    closed: Arc<AtomicBool>,
    encoder: Encoder,
    decoder: Decoder,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("authority", &self.authority)
            .field("quic_versions", &self.quic.versions)
            .field("dialed", &self.dial.get().is_some())
            .field("opts", &self.opts)
            .finish()
    }
}

impl Client {
    /// Client dialing with [`QuicheDialer`].
    pub fn new(
        authority: &str,
        tls: TlsConfig,
        quic: QuicConfig,
        opts: ClientOptions,
    ) -> Result<Self> {
        Self::with_dialer(authority, tls, quic, opts, Arc::new(QuicheDialer::new()))
    }

    /// Client dialing through `dialer`.
    ///
    /// Fails before any I/O if more than one QUIC version is configured or
    /// the version has no HTTP/3 ALPN.
    pub fn with_dialer(
        authority: &str,
        mut tls: TlsConfig,
        mut quic: QuicConfig,
        opts: ClientOptions,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self> {
        if quic.versions.len() > 1 {
            return Err(Error::config(format!(
                "can only use a single QUIC version for dialing a HTTP/3 connection, got {}",
                quic.versions.len()
            )));
        }
        if quic.versions.is_empty() {
            quic.versions = vec![QUIC_VERSION_1];
        }
        let version = quic.versions[0];
        let alpn = alpn_for_version(version)
            .ok_or_else(|| Error::config(format!("unsupported QUIC version 0x{:x}", version)))?;
        tls.alpn = vec![alpn.to_string()];

        quic.enable_datagrams = opts.enable_datagrams;
        if opts.stream_hijacker.is_none() {
            quic.max_incoming_bidi_streams = 0;
        } else if quic.max_incoming_bidi_streams == 0 {
            quic.max_incoming_bidi_streams = HIJACK_BIDI_STREAMS;
        }

        Ok(Self {
            authority: authority_addr(authority),
            tls,
            quic,
            opts,
            dialer,
            dial: OnceLock::new(),
            closed: Arc::new(AtomicBool::new(false)),
            encoder: Encoder::new(),
            decoder: Decoder::new(),
        })
    }

    /// The `host:port` this client is bound to.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn options(&self) -> &ClientOptions {
        &self.opts
    }

    pub fn tls_config(&self) -> &TlsConfig {
        &self.tls
    }

    pub fn quic_config(&self) -> &QuicConfig {
        &self.quic
    }

    /// Start the dial if nobody has yet and return the outcome channel.
    fn start_dial(&self) -> watch::Receiver<Option<DialOutcome>> {
        self.dial
            .get_or_init(|| {
                let (tx, rx) = watch::channel(None);
                let dialer = Arc::clone(&self.dialer);
                let authority = self.authority.clone();
                let tls = self.tls.clone();
                let quic = self.quic.clone();
                let opts = self.opts.clone();
                let closed = Arc::clone(&self.closed);
                tokio::spawn(async move {
                    let outcome = dialer.dial(&authority, &tls, &quic).await;
                    match &outcome {
                        Ok(conn) => {
                            tracing::debug!(%authority, "HTTP/3 connection dialed");
                            start_connection(Arc::clone(conn), &opts);
                        }
                        Err(e) => tracing::debug!(%authority, "HTTP/3 dial failed: {}", e),
                    }
                    let conn = outcome.as_ref().ok().cloned();
                    tx.send_replace(Some(outcome));
                    // close() may have run while the dial was in flight
                    if let Some(conn) = conn {
                        if closed.load(Ordering::SeqCst) {
                            conn.close(ErrorCode::NoError.code(), "");
                        }
                    }
                });
                rx
            })
            .clone()
    }

    /// The connection, dialing on first use.
    async fn connection(&self, ctx: &Context) -> Result<Arc<dyn Connection>> {
        let mut rx = self.start_dial();
        let outcome = ctx
            .run(async move {
                match rx.wait_for(Option::is_some).await {
                    Ok(outcome) => outcome.clone(),
                    Err(_) => None,
                }
            })
            .await?;
        match outcome {
            Some(Ok(conn)) => Ok(conn),
            Some(Err(e)) => Err(Error::Transport(e)),
            None => Err(Error::Transport(TransportError::Dial(
                "dial task stopped".into(),
            ))),
        }
    }

    /// Close the connection with H3_NO_ERROR. A no-op if never dialed;
    /// safe to call repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(rx) = self.dial.get() {
            if let Some(Ok(conn)) = &*rx.borrow() {
                conn.close(ErrorCode::NoError.code(), "");
            }
        }
    }

    /// Send `req` and wait for the response headers.
    ///
    /// A [`Context`] in the request extensions bounds every wait; a method of
    /// `GET_0RTT` is sent as `GET` without waiting for the handshake.
    pub async fn round_trip<B>(&self, req: Request<B>) -> Result<Response>
    where
        B: Into<RequestBody>,
    {
        let (mut parts, body) = req.into_parts();
        let body = body.into();
        let ctx = parts.extensions.get::<Context>().cloned().unwrap_or_default();

        let target = request_authority(&parts)
            .map(|a| authority_addr(&a))
            .unwrap_or_default();
        if target != self.authority {
            return Err(Error::WrongAuthority {
                expected: self.authority.clone(),
                got: target,
            });
        }

        let conn = self.connection(&ctx).await?;

        if parts.method.as_str() == METHOD_GET_0RTT {
            parts.method = Method::GET;
        } else {
            ctx.run(conn.handshake_complete()).await??;
        }

        let stream = ctx.run(conn.open_bidi_stream()).await??;
        let handle = stream.handle();

        let (done_tx, done_rx) = oneshot::channel();
        let watcher = spawn_cancel_watcher(ctx.clone(), handle.clone(), done_rx);

        let res = ctx
            .run(self.do_request(&conn, stream, parts, body, done_tx))
            .await
            .and_then(|res| res);
        match res {
            Ok(rsp) => Ok(rsp),
            Err(err) => {
                watcher.abort();
                if err.is_canceled() {
                    handle.cancel_write(ErrorCode::RequestCancelled.code());
                    handle.cancel_read(ErrorCode::RequestCancelled.code());
                }
                match err.scope() {
                    Some(ErrorScope::Stream(code)) => handle.cancel_write(code.code()),
                    Some(ErrorScope::Connection(code)) => {
                        tracing::debug!(%code, "closing connection: {}", err.message());
                        conn.close(code.code(), &err.message());
                    }
                    None => {}
                }
                Err(err)
            }
        }
    }

    async fn do_request(
        &self,
        conn: &Arc<dyn Connection>,
        stream: BidiStream,
        parts: Parts,
        body: RequestBody,
        done: oneshot::Sender<()>,
    ) -> Result<Response> {
        let (send, mut recv) = stream.into_parts();

        let request_gzip = !self.opts.disable_compression
            && parts.method != Method::HEAD
            && !parts.headers.contains_key(header::ACCEPT_ENCODING)
            && !parts.headers.contains_key(header::RANGE);

        let fields = request::header_fields(&parts, body.len(), request_gzip)?;
        let headers = request::encode_headers(&fields, &self.encoder);
        request::write_request(send, headers, body)?;

        let length = read_headers_frame(&mut recv).await?;
        let max = self.opts.max_header_bytes();
        if length > max {
            return Err(Error::stream(
                ErrorCode::FrameError,
                format!("HEADERS frame too large: {} bytes (max: {})", length, max),
            ));
        }

        let mut block = vec![0u8; length as usize];
        recv.read_exact(&mut block).await.map_err(|e| {
            Error::stream(
                ErrorCode::RequestIncomplete,
                format!("reading HEADERS payload: {}", e),
            )
        })?;
        let decoded = self.decoder.decode_full(&block).map_err(|e| {
            Error::connection(
                ErrorCode::GeneralProtocolError,
                format!("decoding response headers: {}", e),
            )
        })?;

        let (status, mut headers) = response_head(decoded)?;
        let mut content_length = content_length(&parts.method, status, &headers);

        let hook_conn = Arc::clone(conn);
        let on_frame_error = Box::new(move || {
            hook_conn.close(
                ErrorCode::FrameUnexpected.code(),
                "unexpected frame in response body",
            )
        });
        let raw = ResponseBody::new(recv, content_length.known(), done, on_frame_error);

        let gzipped = headers
            .get(header::CONTENT_ENCODING)
            .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"));
        let (body, uncompressed) = if request_gzip && gzipped {
            headers.remove(header::CONTENT_ENCODING);
            headers.remove(header::CONTENT_LENGTH);
            content_length = ContentLength::Unknown;
            (Body::gzip(raw), true)
        } else {
            (Body::Plain(raw), false)
        };

        Ok(Response::new(
            status,
            headers,
            content_length,
            uncompressed,
            conn.info(),
            body,
        ))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Open the control stream and start dispatching peer streams.
fn start_connection(conn: Arc<dyn Connection>, opts: &ClientOptions) {
    tokio::spawn(open_control_stream(Arc::clone(&conn), opts.local_settings()));
    Dispatcher::new(
        conn,
        opts.enable_datagrams,
        opts.stream_hijacker.clone(),
        opts.uni_stream_hijacker.clone(),
    )
    .spawn();
}

async fn open_control_stream(conn: Arc<dyn Connection>, settings: Settings) {
    let mut send = match conn.open_uni_stream().await {
        Ok(send) => send,
        Err(e) => {
            tracing::debug!("opening control stream failed: {}", e);
            conn.close(ErrorCode::InternalError.code(), "");
            return;
        }
    };
    let mut buf = BytesMut::new();
    varint::encode(StreamType::Control.into(), &mut buf);
    settings.encode_frame(&mut buf);
    if let Err(e) = send.write(buf.freeze()) {
        tracing::debug!("writing SETTINGS failed: {}", e);
        conn.close(ErrorCode::InternalError.code(), "");
    }
}

/// Cancel both halves of the stream if `ctx` finishes before the request
/// signals completion.
fn spawn_cancel_watcher(
    ctx: Context,
    handle: StreamHandle,
    done: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = ctx.done() => {
                tracing::debug!(stream = handle.id(), "request canceled");
                handle.cancel_write(ErrorCode::RequestCancelled.code());
                handle.cancel_read(ErrorCode::RequestCancelled.code());
            }
            _ = done => {}
        }
    })
}

/// Read up to the first HEADERS frame and return its length. Unknown frames
/// before it are skipped.
async fn read_headers_frame(recv: &mut RecvStream) -> Result<u64> {
    loop {
        let frame = frame::read_frame(recv).await.map_err(|e| {
            Error::stream(ErrorCode::FrameError, format!("reading response frame: {}", e))
        })?;
        match frame {
            Frame::Headers { length } => return Ok(length),
            Frame::Unknown { .. } => continue,
            _ => {
                return Err(Error::connection(
                    ErrorCode::FrameUnexpected,
                    "expected first frame to be a HEADERS frame",
                ))
            }
        }
    }
}

/// Split a decoded field section into status and header map.
fn response_head(fields: Vec<HeaderField>) -> Result<(StatusCode, HeaderMap)> {
    let mut status = None;
    let mut headers = HeaderMap::with_capacity(fields.len());
    for field in fields {
        if field.is_pseudo() {
            if field.name.as_ref() != b":status" {
                return Err(Error::stream(
                    ErrorCode::MessageError,
                    format!(
                        "invalid response pseudo header: {}",
                        String::from_utf8_lossy(&field.name)
                    ),
                ));
            }
            let parsed = std::str::from_utf8(&field.value)
                .ok()
                .and_then(|s| s.parse::<u16>().ok())
                .and_then(|code| StatusCode::from_u16(code).ok());
            match parsed {
                Some(code) => status = Some(code),
                None => {
                    return Err(Error::stream(
                        ErrorCode::GeneralProtocolError,
                        format!(
                            "invalid status code: {:?}",
                            String::from_utf8_lossy(&field.value)
                        ),
                    ))
                }
            }
            continue;
        }

        let name = HeaderName::from_bytes(&field.name).map_err(|_| {
            Error::stream(
                ErrorCode::MessageError,
                format!(
                    "invalid header name: {:?}",
                    String::from_utf8_lossy(&field.name)
                ),
            )
        })?;
        let value = HeaderValue::from_maybe_shared(field.value).map_err(|_| {
            Error::stream(
                ErrorCode::MessageError,
                format!("invalid value for header {}", name),
            )
        })?;
        headers.append(name, value);
    }

    let status = status.ok_or_else(|| {
        Error::stream(ErrorCode::GeneralProtocolError, "missing :status pseudo header")
    })?;
    Ok((status, headers))
}

/// Resolve the declared body length of a response.
fn content_length(method: &Method, status: StatusCode, headers: &HeaderMap) -> ContentLength {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return ContentLength::Unknown;
    }
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || (method == Method::CONNECT && status.is_success())
    {
        return ContentLength::NotApplicable;
    }
    let mut values = headers.get_all(header::CONTENT_LENGTH).iter();
    match (values.next(), values.next()) {
        (Some(value), None) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(ContentLength::Known)
            .unwrap_or(ContentLength::Unknown),
        _ => ContentLength::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(pairs: &[(&'static str, &'static str)]) -> Vec<HeaderField> {
        pairs
            .iter()
            .map(|(n, v)| HeaderField::new(*n, *v))
            .collect()
    }

    #[test]
    fn test_authority_addr() {
        assert_eq!(authority_addr("example.com"), "example.com:443");
        assert_eq!(authority_addr("example.com:8443"), "example.com:8443");
        assert_eq!(authority_addr("[::1]"), "[::1]:443");
        assert_eq!(authority_addr("[::1]:4433"), "[::1]:4433");
    }

    #[test]
    fn test_rejects_multiple_versions() {
        let quic = QuicConfig::default().with_versions(vec![
            QUIC_VERSION_1,
            crate::transport::QUIC_VERSION_DRAFT_29,
        ]);
        let err = Client::new(
            "example.com",
            TlsConfig::default(),
            quic,
            ClientOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_alpn_follows_version() {
        let client = Client::new(
            "example.com",
            TlsConfig::default(),
            QuicConfig::default(),
            ClientOptions::default(),
        )
        .unwrap();
        assert_eq!(client.tls_config().alpn, vec!["h3".to_string()]);
        assert_eq!(client.quic_config().versions, vec![QUIC_VERSION_1]);
        assert_eq!(client.quic_config().max_incoming_bidi_streams, 0);
        assert_eq!(client.authority(), "example.com:443");

        let draft = QuicConfig::default().with_versions(vec![crate::transport::QUIC_VERSION_DRAFT_29]);
        let client = Client::new(
            "example.com",
            TlsConfig::default(),
            draft,
            ClientOptions::default().with_datagrams(true),
        )
        .unwrap();
        assert_eq!(client.tls_config().alpn, vec!["h3-29".to_string()]);
        assert!(client.quic_config().enable_datagrams);
    }

    #[test]
    fn test_close_without_dial() {
        let client = Client::new(
            "example.com",
            TlsConfig::default(),
            QuicConfig::default(),
            ClientOptions::default(),
        )
        .unwrap();
        client.close();
        client.close();
    }

    #[test]
    fn test_response_head() {
        let (status, headers) = response_head(head(&[
            (":status", "200"),
            ("set-cookie", "a=1"),
            ("set-cookie", "b=2"),
        ]))
        .unwrap();
        assert_eq!(status, StatusCode::OK);
        let cookies: Vec<_> = headers.get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    #[test]
    fn test_response_head_bad_status() {
        let err = response_head(head(&[(":status", "abc")])).unwrap_err();
        assert_eq!(
            err.scope(),
            Some(ErrorScope::Stream(ErrorCode::GeneralProtocolError))
        );
        let err = response_head(head(&[("content-type", "text/plain")])).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::GeneralProtocolError));
        let err = response_head(head(&[(":status", "200"), (":path", "/")])).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::MessageError));
    }

    #[test]
    fn test_content_length_resolution() {
        let headers_with = |pairs: &[(&'static str, &'static str)]| {
            let mut map = HeaderMap::new();
            for (n, v) in pairs {
                map.append(*n, HeaderValue::from_static(*v));
            }
            map
        };

        let h = headers_with(&[("content-length", "17")]);
        assert_eq!(
            content_length(&Method::GET, StatusCode::NO_CONTENT, &h),
            ContentLength::NotApplicable
        );
        assert_eq!(
            content_length(&Method::GET, StatusCode::OK, &h),
            ContentLength::Known(17)
        );
        assert_eq!(
            content_length(&Method::CONNECT, StatusCode::OK, &h),
            ContentLength::NotApplicable
        );
        assert_eq!(
            content_length(&Method::GET, StatusCode::CONTINUE, &h),
            ContentLength::NotApplicable
        );

        let h = headers_with(&[("content-length", "10"), ("content-length", "20")]);
        assert_eq!(
            content_length(&Method::GET, StatusCode::OK, &h),
            ContentLength::Unknown
        );

        let h = headers_with(&[("content-length", "ten")]);
        assert_eq!(
            content_length(&Method::GET, StatusCode::OK, &h),
            ContentLength::Unknown
        );

        let h = headers_with(&[("transfer-encoding", "chunked"), ("content-length", "5")]);
        assert_eq!(
            content_length(&Method::GET, StatusCode::NO_CONTENT, &h),
            ContentLength::Unknown
        );
    }
}
