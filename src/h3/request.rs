//! Request serialization: HEADERS and DATA frames on a request stream.

use std::fmt;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderName};
use http::request::Parts;
use http::Method;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::h3::error::ErrorCode;
use crate::h3::frame::{self, FrameType};
use crate::h3::qpack::{Encoder, HeaderField};
use crate::transport::{SendStream, TransportError};

/// User-Agent sent when the request carries none.
pub const DEFAULT_USER_AGENT: &str = concat!("specter-h3/", env!("CARGO_PKG_VERSION"));

/// Largest DATA frame payload produced for streaming bodies.
const BODY_CHUNK: usize = 8 * 1024;

/// Connection-specific headers that HTTP/3 forbids (RFC 9114 Section 4.2).
const HOP_BY_HOP: [&str; 5] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
];

/// Request body.
#[derive(Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Full(Bytes),
    /// Body of unknown length, sent as it is read.
    Stream(Pin<Box<dyn AsyncRead + Send>>),
}

impl RequestBody {
    pub fn empty() -> Self {
        RequestBody::Empty
    }

    pub fn stream<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        RequestBody::Stream(Box::pin(reader))
    }

    /// Length when known up front.
    pub fn len(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Full(data) => Some(data.len() as u64),
            RequestBody::Stream(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Full(data) => f.debug_tuple("Full").field(&data.len()).finish(),
            RequestBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<()> for RequestBody {
    fn from(_: ()) -> Self {
        RequestBody::Empty
    }
}

impl From<Bytes> for RequestBody {
    fn from(data: Bytes) -> Self {
        RequestBody::Full(data)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(data: Vec<u8>) -> Self {
        RequestBody::Full(data.into())
    }
}

impl From<String> for RequestBody {
    fn from(data: String) -> Self {
        RequestBody::Full(data.into())
    }
}

impl From<&'static str> for RequestBody {
    fn from(data: &'static str) -> Self {
        RequestBody::Full(Bytes::from_static(data.as_bytes()))
    }
}

impl From<&'static [u8]> for RequestBody {
    fn from(data: &'static [u8]) -> Self {
        RequestBody::Full(Bytes::from_static(data))
    }
}

/// Build the header list for a request.
pub(crate) fn header_fields(
    parts: &Parts,
    body_len: Option<u64>,
    request_gzip: bool,
) -> Result<Vec<HeaderField>> {
    let authority = match parts.uri.authority() {
        Some(authority) => authority.as_str().to_string(),
        None => parts
            .headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::invalid_request("missing authority"))?,
    };

    let mut fields = Vec::with_capacity(parts.headers.len() + 6);
    fields.push(HeaderField::new(":authority", authority));
    fields.push(HeaderField::new(
        ":method",
        Bytes::copy_from_slice(parts.method.as_str().as_bytes()),
    ));
    if parts.method != Method::CONNECT {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or("/");
        fields.push(HeaderField::new(":path", Bytes::copy_from_slice(path.as_bytes())));
        let scheme = parts.uri.scheme_str().unwrap_or("https");
        fields.push(HeaderField::new(
            ":scheme",
            Bytes::copy_from_slice(scheme.as_bytes()),
        ));
    }

    for (name, value) in &parts.headers {
        if is_dropped(name) {
            continue;
        }
        fields.push(HeaderField::new(
            Bytes::copy_from_slice(name.as_str().as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
        ));
    }

    if !parts.headers.contains_key(header::CONTENT_LENGTH) {
        match body_len {
            Some(0) => {
                if matches!(parts.method, Method::POST | Method::PUT | Method::PATCH) {
                    fields.push(HeaderField::new("content-length", "0"));
                }
            }
            Some(len) => fields.push(HeaderField::new("content-length", len.to_string())),
            None => {}
        }
    }
    if request_gzip {
        fields.push(HeaderField::new("accept-encoding", "gzip"));
    }
    if !parts.headers.contains_key(header::USER_AGENT) {
        fields.push(HeaderField::new("user-agent", DEFAULT_USER_AGENT));
    }

    Ok(fields)
}

fn is_dropped(name: &HeaderName) -> bool {
    name == header::HOST || HOP_BY_HOP.contains(&name.as_str())
}

/// Encode the request head as a HEADERS frame.
pub(crate) fn encode_headers(fields: &[HeaderField], encoder: &Encoder) -> Bytes {
    let block = encoder.encode(fields);
    let mut buf = BytesMut::with_capacity(block.len() + 16);
    frame::encode_frame(&mut buf, FrameType::Headers, &block);
    buf.freeze()
}

/// Write the request onto `send`.
///
/// Fixed bodies are written inline and the stream is finished; streaming
/// bodies are pumped by a spawned task that finishes the stream at EOF, or
/// resets it with H3_REQUEST_CANCELLED if the source fails.
pub(crate) fn write_request(mut send: SendStream, headers: Bytes, body: RequestBody) -> Result<()> {
    let write_err = |e: TransportError| Error::stream(ErrorCode::InternalError, format!("writing request: {}", e));
    match body {
        RequestBody::Empty => send.write_final(headers).map_err(write_err),
        RequestBody::Full(data) if data.is_empty() => send.write_final(headers).map_err(write_err),
        RequestBody::Full(data) => {
            let mut buf = BytesMut::with_capacity(headers.len() + 16);
            buf.extend_from_slice(&headers);
            frame::encode_frame_header(&mut buf, FrameType::Data, data.len() as u64);
            send.write(buf.freeze()).map_err(write_err)?;
            send.write_final(data).map_err(write_err)
        }
        RequestBody::Stream(reader) => {
            send.write(headers).map_err(write_err)?;
            tokio::spawn(pump_body(send, reader));
            Ok(())
        }
    }
}

/// Copy `reader` into DATA frames until EOF.
async fn pump_body(mut send: SendStream, mut reader: Pin<Box<dyn AsyncRead + Send>>) {
    let mut chunk = vec![0u8; BODY_CHUNK];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                let _ = send.finish();
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(stream = send.id(), "request body read failed: {}", e);
                send.cancel_write(ErrorCode::RequestCancelled.code());
                return;
            }
        };
        let mut buf = BytesMut::with_capacity(n + 16);
        frame::encode_frame_header(&mut buf, FrameType::Data, n as u64);
        buf.extend_from_slice(&chunk[..n]);
        if let Err(e) = send.write(buf.freeze()) {
            tracing::debug!(stream = send.id(), "request body write failed: {}", e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h3::qpack::Decoder;
    use crate::transport::{mem, Connection};

    fn parts(req: http::Request<()>) -> Parts {
        req.into_parts().0
    }

    fn lookup<'a>(fields: &'a [HeaderField], name: &str) -> Vec<&'a [u8]> {
        fields
            .iter()
            .filter(|f| f.name.as_ref() == name.as_bytes())
            .map(|f| f.value.as_ref())
            .collect()
    }

    #[test]
    fn test_pseudo_headers_first() {
        let req = http::Request::get("https://example.com/a?b=c").body(()).unwrap();
        let fields = header_fields(&parts(req), Some(0), false).unwrap();
        let names: Vec<&[u8]> = fields.iter().take(4).map(|f| f.name.as_ref()).collect();
        assert_eq!(
            names,
            vec![&b":authority"[..], b":method", b":path", b":scheme"]
        );
        assert_eq!(lookup(&fields, ":path"), vec![&b"/a?b=c"[..]]);
        assert_eq!(lookup(&fields, ":authority"), vec![&b"example.com"[..]]);
        assert_eq!(
            lookup(&fields, "user-agent"),
            vec![DEFAULT_USER_AGENT.as_bytes()]
        );
        assert!(lookup(&fields, "content-length").is_empty());
    }

    #[test]
    fn test_connect_omits_path_and_scheme() {
        let req = http::Request::builder()
            .method(Method::CONNECT)
            .uri("proxy.example:443")
            .body(())
            .unwrap();
        let fields = header_fields(&parts(req), None, false).unwrap();
        assert!(lookup(&fields, ":path").is_empty());
        assert!(lookup(&fields, ":scheme").is_empty());
        assert_eq!(lookup(&fields, ":authority"), vec![&b"proxy.example:443"[..]]);
    }

    #[test]
    fn test_hop_by_hop_headers_dropped() {
        let req = http::Request::get("https://example.com/")
            .header("connection", "keep-alive")
            .header("transfer-encoding", "chunked")
            .header("host", "other.example")
            .header("x-custom", "1")
            .header("user-agent", "custom/1.0")
            .body(())
            .unwrap();
        let fields = header_fields(&parts(req), Some(0), true).unwrap();
        assert!(lookup(&fields, "connection").is_empty());
        assert!(lookup(&fields, "transfer-encoding").is_empty());
        assert!(lookup(&fields, "host").is_empty());
        assert_eq!(lookup(&fields, "x-custom"), vec![&b"1"[..]]);
        assert_eq!(lookup(&fields, "user-agent"), vec![&b"custom/1.0"[..]]);
        assert_eq!(lookup(&fields, "accept-encoding"), vec![&b"gzip"[..]]);
    }

    #[test]
    fn test_content_length_rules() {
        let post = || http::Request::post("https://example.com/").body(()).unwrap();
        let fields = header_fields(&parts(post()), Some(0), false).unwrap();
        assert_eq!(lookup(&fields, "content-length"), vec![&b"0"[..]]);

        let fields = header_fields(&parts(post()), Some(12), false).unwrap();
        assert_eq!(lookup(&fields, "content-length"), vec![&b"12"[..]]);

        let fields = header_fields(&parts(post()), None, false).unwrap();
        assert!(lookup(&fields, "content-length").is_empty());
    }

    #[test]
    fn test_missing_authority() {
        let req = http::Request::get("/relative").body(()).unwrap();
        assert!(matches!(
            header_fields(&parts(req), Some(0), false),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_write_request_with_body() {
        let (client, server) = mem::pair();
        let local = client.open_bidi_stream().await.unwrap();
        let mut remote = server.accept_bidi_stream().await.unwrap();

        let req = http::Request::post("https://example.com/upload").body(()).unwrap();
        let fields = header_fields(&parts(req), Some(5), false).unwrap();
        let headers = encode_headers(&fields, &Encoder::new());
        write_request(local.send, headers, RequestBody::from("hello")).unwrap();

        let frame = frame::read_frame(&mut remote.recv).await.unwrap();
        let frame::Frame::Headers { length } = frame else {
            panic!("expected HEADERS, got {:?}", frame);
        };
        let mut block = vec![0u8; length as usize];
        remote.recv.read_exact(&mut block).await.unwrap();
        let decoded = Decoder::new().decode_full(&block).unwrap();
        assert_eq!(decoded, fields);

        let frame = frame::read_frame(&mut remote.recv).await.unwrap();
        assert_eq!(frame, frame::Frame::Data { length: 5 });
        let mut rest = Vec::new();
        remote.recv.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"hello");
    }

    #[tokio::test]
    async fn test_streaming_body_is_chunked() {
        let (client, server) = mem::pair();
        let local = client.open_bidi_stream().await.unwrap();
        let mut remote = server.accept_bidi_stream().await.unwrap();

        let payload = vec![7u8; BODY_CHUNK + 100];
        let body = RequestBody::stream(std::io::Cursor::new(payload.clone()));
        write_request(local.send, Bytes::from_static(b"\x01\x00"), body).unwrap();

        assert_eq!(
            frame::read_frame(&mut remote.recv).await.unwrap(),
            frame::Frame::Headers { length: 0 }
        );
        let mut received = Vec::new();
        loop {
            match frame::read_frame(&mut remote.recv).await {
                Ok(frame::Frame::Data { length }) => {
                    assert!(length as usize <= BODY_CHUNK);
                    let mut chunk = vec![0u8; length as usize];
                    remote.recv.read_exact(&mut chunk).await.unwrap();
                    received.extend_from_slice(&chunk);
                }
                Ok(other) => panic!("unexpected frame {:?}", other),
                Err(_) => break,
            }
        }
        assert_eq!(received, payload);
    }
}
