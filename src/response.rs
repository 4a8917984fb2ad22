//! HTTP/3 response with a streaming body.

use std::io;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};
use crate::h3::body::Body;
use crate::transport::ConnectionInfo;

/// Declared length of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentLength {
    /// The status carries no content (1xx, 204, successful CONNECT).
    NotApplicable,
    /// Read until the stream ends.
    Unknown,
    Known(u64),
}

impl ContentLength {
    pub fn known(&self) -> Option<u64> {
        match self {
            ContentLength::Known(n) => Some(*n),
            _ => None,
        }
    }

    /// Length as a signed count, `-1` when unknown; `None` when not
    /// applicable.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ContentLength::NotApplicable => None,
            ContentLength::Unknown => Some(-1),
            ContentLength::Known(n) => Some(i64::try_from(*n).unwrap_or(i64::MAX)),
        }
    }
}

/// Response returned by a round trip.
///
/// Headers are fully parsed; the body is read from the request stream on
/// demand. Close (or drop) the response to release the stream.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: ContentLength,
    /// The body was transparently gunzipped; `content-encoding` and
    /// `content-length` were removed from `headers`.
    pub uncompressed: bool,
    /// Connection state when the response arrived.
    pub tls: ConnectionInfo,
    body: Body,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        content_length: ContentLength,
        uncompressed: bool,
        tls: ConnectionInfo,
        body: Body,
    ) -> Self {
        Self {
            status,
            headers,
            content_length,
            uncompressed,
            tls,
            body,
        }
    }

    /// Status code and reason phrase, e.g. `"200 OK"`.
    pub fn status_line(&self) -> String {
        match self.status.canonical_reason() {
            Some(reason) => format!("{} {}", self.status.as_u16(), reason),
            None => self.status.as_u16().to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn get_headers(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get_header("content-type")
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn into_body(self) -> Body {
        self.body
    }

    /// Abandon the rest of the body.
    pub fn close(&mut self) {
        self.body.close();
    }

    /// Read the whole body, then close it.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = Vec::new();
        let res = self.body.read_to_end(&mut buf).await;
        self.body.close();
        match res {
            Ok(_) => Ok(Bytes::from(buf)),
            Err(e) if self.uncompressed && e.kind() == io::ErrorKind::InvalidData => {
                Err(Error::Decompression(e.to_string()))
            }
            Err(e) => Err(Error::from_io(e)),
        }
    }

    pub async fn text(self) -> Result<String> {
        let body = self.bytes().await?;
        String::from_utf8(body.to_vec())
            .map_err(|e| Error::Decompression(format!("UTF-8 decode error: {}", e)))
    }
}
