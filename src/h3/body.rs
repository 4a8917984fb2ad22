//! Response body readers.
//!
//! [`ResponseBody`] strips HTTP/3 framing off a request stream and yields
//! the DATA payload; [`Body`] optionally layers transparent gzip on top.

use std::fmt;
use std::io::{self, Write};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use flate2::write::GzDecoder;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::oneshot;

use crate::h3::error::ErrorCode;
use crate::h3::frame::FrameType;
use crate::h3::varint;
use crate::transport::RecvStream;

/// Invoked once when a frame that may not appear in a response body arrives.
pub(crate) type FrameErrorHook = Box<dyn FnOnce() + Send + Sync>;

/// Longest frame header: two 8-byte varints.
const MAX_FRAME_HEADER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Collecting a frame header.
    Header,
    /// Inside a DATA payload.
    Data(u64),
    /// Discarding the payload of an ignored frame.
    Skip(u64),
    /// Clean end of body.
    Eof,
    Failed,
}

/// DATA payload of one response.
///
/// Closing or dropping the body before the stream ended cancels the read
/// side with H3_REQUEST_CANCELLED.
pub struct ResponseBody {
    stream: RecvStream,
    state: ReadState,
    header: [u8; MAX_FRAME_HEADER],
    header_len: usize,
    /// Bytes still allowed by a declared Content-Length.
    remaining: Option<u64>,
    /// Underlying stream delivered FIN.
    finished: bool,
    closed: bool,
    done: Option<oneshot::Sender<()>>,
    on_frame_error: Option<FrameErrorHook>,
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("stream", &self.stream.id())
            .field("state", &self.state)
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl ResponseBody {
    pub(crate) fn new(
        stream: RecvStream,
        content_length: Option<u64>,
        done: oneshot::Sender<()>,
        on_frame_error: FrameErrorHook,
    ) -> Self {
        Self {
            stream,
            state: ReadState::Header,
            header: [0; MAX_FRAME_HEADER],
            header_len: 0,
            remaining: content_length,
            finished: false,
            closed: false,
            done: Some(done),
            on_frame_error: Some(on_frame_error),
        }
    }

    /// Release the request: the cancellation watcher stops once this fires.
    fn signal_done(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }

    fn fail(&mut self, err: io::Error) -> Poll<io::Result<()>> {
        self.state = ReadState::Failed;
        self.signal_done();
        Poll::Ready(Err(err))
    }

    /// Stop reading. Unread data is abandoned with STOP_SENDING.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.finished {
            self.stream.cancel_read(ErrorCode::RequestCancelled.code());
        }
        self.signal_done();
    }

    /// Try to parse a complete frame header from `self.header`.
    fn parse_header(&self) -> Option<(u64, u64)> {
        let (frame_type, n) = varint::decode(&self.header[..self.header_len])?;
        let (length, _) = varint::decode(&self.header[n..self.header_len])?;
        Some((frame_type, length))
    }

    /// Bytes needed before the header buffer holds a complete frame header.
    fn header_wanted(&self) -> usize {
        if self.header_len == 0 {
            return 1;
        }
        let type_len = varint::len_from_first_byte(self.header[0]);
        if self.header_len < type_len {
            return type_len - self.header_len;
        }
        if self.header_len == type_len {
            return 1;
        }
        let len_len = varint::len_from_first_byte(self.header[type_len]);
        (type_len + len_len).saturating_sub(self.header_len)
    }

    fn poll_header(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            if let Some((frame_type, length)) = self.parse_header() {
                self.header_len = 0;
                self.state = match FrameType::from(frame_type) {
                    FrameType::Data => ReadState::Data(length),
                    // trailers are not surfaced
                    FrameType::Headers | FrameType::Unknown(_) => ReadState::Skip(length),
                    other => {
                        tracing::debug!(stream = self.stream.id(), ?other, "unexpected frame in response body");
                        if let Some(hook) = self.on_frame_error.take() {
                            hook();
                        }
                        return self.fail(io::Error::other(format!(
                            "unexpected {:?} frame in response body",
                            other
                        )));
                    }
                };
                return Poll::Ready(Ok(()));
            }

            let wanted = self.header_wanted();
            let start = self.header_len;
            let mut buf = ReadBuf::new(&mut self.header[start..start + wanted]);
            match Pin::new(&mut self.stream).poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) => {
                    let n = buf.filled().len();
                    if n == 0 {
                        self.finished = true;
                        if self.header_len == 0 {
                            self.state = ReadState::Eof;
                            self.signal_done();
                            return Poll::Ready(Ok(()));
                        }
                        return self.fail(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream ended inside frame header",
                        ));
                    }
                    self.header_len += n;
                }
                Poll::Ready(Err(e)) => return self.fail(e),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_skip(&mut self, cx: &mut Context<'_>, mut left: u64) -> Poll<io::Result<()>> {
        let mut scratch = [0u8; 512];
        while left > 0 {
            let want = (left as usize).min(scratch.len());
            let mut buf = ReadBuf::new(&mut scratch[..want]);
            match Pin::new(&mut self.stream).poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) => {
                    let n = buf.filled().len();
                    if n == 0 {
                        self.finished = true;
                        return self.fail(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream ended inside frame payload",
                        ));
                    }
                    left -= n as u64;
                    self.state = ReadState::Skip(left);
                }
                Poll::Ready(Err(e)) => return self.fail(e),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.state = ReadState::Header;
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for ResponseBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.closed {
            return Poll::Ready(Err(io::Error::other("read on closed response body")));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if this.remaining == Some(0) {
                this.state = ReadState::Eof;
                this.signal_done();
            }

            match this.state {
                ReadState::Eof => return Poll::Ready(Ok(())),
                ReadState::Failed => {
                    return Poll::Ready(Err(io::Error::other("response body read failed")))
                }
                ReadState::Header => ready!(this.poll_header(cx))?,
                ReadState::Skip(left) => ready!(this.poll_skip(cx, left))?,
                ReadState::Data(0) => this.state = ReadState::Header,
                ReadState::Data(left) => {
                    let mut limit = left.min(buf.remaining() as u64);
                    if let Some(remaining) = this.remaining {
                        limit = limit.min(remaining);
                    }
                    let dst = buf.initialize_unfilled_to(limit as usize);
                    let mut sub = ReadBuf::new(dst);
                    match Pin::new(&mut this.stream).poll_read(cx, &mut sub) {
                        Poll::Ready(Ok(())) => {
                            let n = sub.filled().len();
                            if n == 0 {
                                this.finished = true;
                                return this.fail(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "stream ended inside DATA frame",
                                ));
                            }
                            buf.advance(n);
                            this.state = ReadState::Data(left - n as u64);
                            if let Some(remaining) = this.remaining.as_mut() {
                                *remaining -= n as u64;
                            }
                            return Poll::Ready(Ok(()));
                        }
                        Poll::Ready(Err(e)) => return this.fail(e),
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        self.close();
    }
}

/// Gunzips a [`ResponseBody`] as it is read.
pub struct GzipBody {
    inner: ResponseBody,
    decoder: GzDecoder<Vec<u8>>,
    scratch: Box<[u8]>,
    finished: bool,
}

impl fmt::Debug for GzipBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GzipBody")
            .field("inner", &self.inner)
            .field("finished", &self.finished)
            .finish()
    }
}

impl GzipBody {
    fn new(inner: ResponseBody) -> Self {
        Self {
            inner,
            decoder: GzDecoder::new(Vec::new()),
            scratch: vec![0u8; 8 * 1024].into_boxed_slice(),
            finished: false,
        }
    }
}

impl AsyncRead for GzipBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            let out = this.decoder.get_mut();
            if !out.is_empty() {
                let n = out.len().min(buf.remaining());
                buf.put_slice(&out[..n]);
                out.drain(..n);
                return Poll::Ready(Ok(()));
            }
            if this.finished {
                return Poll::Ready(Ok(()));
            }

            let mut read = ReadBuf::new(&mut this.scratch);
            match Pin::new(&mut this.inner).poll_read(cx, &mut read) {
                Poll::Ready(Ok(())) => {
                    let filled = read.filled();
                    if filled.is_empty() {
                        this.decoder.try_finish().map_err(gzip_error)?;
                        this.finished = true;
                    } else {
                        this.decoder.write_all(filled).map_err(gzip_error)?;
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn gzip_error(err: io::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("gzip: {}", err))
}

/// Body of a [`Response`](crate::Response).
#[derive(Debug)]
pub enum Body {
    Plain(ResponseBody),
    Gzip(Box<GzipBody>),
}

impl Body {
    pub(crate) fn gzip(inner: ResponseBody) -> Self {
        Body::Gzip(Box::new(GzipBody::new(inner)))
    }

    /// Stop reading and release the stream.
    pub fn close(&mut self) {
        match self {
            Body::Plain(body) => body.close(),
            Body::Gzip(body) => body.inner.close(),
        }
    }
}

impl AsyncRead for Body {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Body::Plain(body) => Pin::new(body).poll_read(cx, buf),
            Body::Gzip(body) => Pin::new(body.as_mut()).poll_read(cx, buf),
        }
    }
}
