//! Channel-backed stream halves shared by every transport implementation.
//!
//! A transport owns the real stream state in a single task (a quiche driver,
//! the in-memory router) and talks to these handles over channels:
//! outbound operations become [`StreamCommand`]s, inbound bytes arrive as
//! [`RecvEvent`]s.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, watch};

use super::{CloseReason, StreamId, TransportError};

/// Outbound operation on a stream, processed by the transport task.
#[derive(Debug)]
pub enum StreamCommand {
    Write {
        id: StreamId,
        data: Bytes,
        fin: bool,
    },
    /// STOP_SENDING: abort the receive half.
    StopSending { id: StreamId, code: u64 },
    /// RESET_STREAM: abort the send half.
    Reset { id: StreamId, code: u64 },
    /// The receive half drained below [`RECV_WINDOW`]; resume reading.
    Resume { id: StreamId },
}

/// Bytes a transport may hand to one receive half ahead of the reader.
/// Past this the transport leaves data with QUIC, so flow control holds the
/// peer back.
pub const RECV_WINDOW: usize = 1 << 20;

/// Inbound event delivered to a [`RecvStream`].
#[derive(Debug)]
pub enum RecvEvent {
    Data(Bytes),
    Fin,
    Reset(u64),
}

pub(crate) type CommandTx = mpsc::UnboundedSender<StreamCommand>;

/// Transport side of a receive half.
#[derive(Debug)]
pub(crate) struct RecvFeed {
    events: mpsc::UnboundedSender<RecvEvent>,
    buffered: Arc<AtomicUsize>,
}

impl RecvFeed {
    /// Deliver an event. Returns false once the receive half is gone.
    pub(crate) fn send(&self, event: RecvEvent) -> bool {
        if let RecvEvent::Data(data) = &event {
            self.buffered.fetch_add(data.len(), Ordering::AcqRel);
        }
        self.events.send(event).is_ok()
    }

    /// Bytes delivered but not yet read.
    pub(crate) fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    pub(crate) fn is_full(&self) -> bool {
        self.buffered() >= RECV_WINDOW
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

pub(crate) type ClosedRx = watch::Receiver<Option<CloseReason>>;

fn closed_reason(closed: &ClosedRx) -> Option<CloseReason> {
    closed.borrow().clone()
}

/// Wrap a transport error for `AsyncRead` callers.
pub(crate) fn io_error(err: TransportError) -> io::Error {
    let kind = match err {
        TransportError::StreamReset { .. } => io::ErrorKind::ConnectionReset,
        TransportError::Closed(_) => io::ErrorKind::NotConnected,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

/// Cancels either half of a stream from any task.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    id: StreamId,
    commands: CommandTx,
}

impl StreamHandle {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Abort reading with `code` (sends STOP_SENDING).
    pub fn cancel_read(&self, code: u64) {
        let _ = self.commands.send(StreamCommand::StopSending { id: self.id, code });
    }

    /// Abort writing with `code` (sends RESET_STREAM).
    pub fn cancel_write(&self, code: u64) {
        let _ = self.commands.send(StreamCommand::Reset { id: self.id, code });
    }
}

/// Send half of a stream.
pub struct SendStream {
    id: StreamId,
    commands: CommandTx,
    stopped: watch::Receiver<Option<u64>>,
    closed: ClosedRx,
    done: bool,
}

impl std::fmt::Debug for SendStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendStream")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish()
    }
}

impl SendStream {
    pub(crate) fn new(
        id: StreamId,
        commands: CommandTx,
        stopped: watch::Receiver<Option<u64>>,
        closed: ClosedRx,
    ) -> Self {
        Self {
            id,
            commands,
            stopped,
            closed,
            done: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn handle(&self) -> StreamHandle {
        StreamHandle {
            id: self.id,
            commands: self.commands.clone(),
        }
    }

    fn check_writable(&self) -> Result<(), TransportError> {
        if let Some(reason) = closed_reason(&self.closed) {
            return Err(TransportError::Closed(reason));
        }
        if let Some(code) = *self.stopped.borrow() {
            return Err(TransportError::StreamStopped { id: self.id, code });
        }
        if self.done {
            return Err(TransportError::StreamFinished(self.id));
        }
        Ok(())
    }

    fn submit(&mut self, data: Bytes, fin: bool) -> Result<(), TransportError> {
        self.check_writable()?;
        self.commands
            .send(StreamCommand::Write {
                id: self.id,
                data,
                fin,
            })
            .map_err(|_| match closed_reason(&self.closed) {
                Some(reason) => TransportError::Closed(reason),
                None => TransportError::StreamFinished(self.id),
            })?;
        if fin {
            self.done = true;
        }
        Ok(())
    }

    /// Queue `data` for sending.
    ///
    /// Buffering is unbounded; the transport applies flow control when it
    /// drains the queue.
    pub fn write(&mut self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        let data = data.into();
        if data.is_empty() {
            return self.check_writable();
        }
        self.submit(data, false)
    }

    /// Queue `data` and close the send half after it.
    pub fn write_final(&mut self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        self.submit(data.into(), true)
    }

    /// Close the send half cleanly (FIN).
    pub fn finish(&mut self) -> Result<(), TransportError> {
        self.submit(Bytes::new(), true)
    }

    /// Abort the send half with an application error code.
    pub fn cancel_write(&mut self, code: u64) {
        if !self.done {
            self.done = true;
            let _ = self.commands.send(StreamCommand::Reset { id: self.id, code });
        }
    }

    /// Resolves with the peer's STOP_SENDING code.
    pub async fn stopped(&self) -> Result<u64, TransportError> {
        let mut stopped = self.stopped.clone();
        let mut closed = self.closed.clone();
        tokio::select! {
            res = stopped.wait_for(Option::is_some) => match res {
                Ok(code) => Ok(code.unwrap_or_default()),
                Err(_) => Err(TransportError::Closed(
                    closed_reason(&self.closed).unwrap_or_else(|| CloseReason {
                        code: 0,
                        reason: "transport gone".into(),
                        remote: false,
                    }),
                )),
            },
            Ok(reason) = closed.wait_for(Option::is_some) => {
                let reason = reason.clone().unwrap_or_else(|| CloseReason {
                    code: 0,
                    reason: String::new(),
                    remote: false,
                });
                Err(TransportError::Closed(reason))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    Open,
    Finished,
    Reset(u64),
}

/// Receive half of a stream.
pub struct RecvStream {
    id: StreamId,
    events: mpsc::UnboundedReceiver<RecvEvent>,
    window: Arc<AtomicUsize>,
    buffered: Bytes,
    commands: CommandTx,
    closed: ClosedRx,
    state: RecvState,
}

impl std::fmt::Debug for RecvStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvStream")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

impl RecvStream {
    pub(crate) fn new(
        id: StreamId,
        events: mpsc::UnboundedReceiver<RecvEvent>,
        window: Arc<AtomicUsize>,
        commands: CommandTx,
        closed: ClosedRx,
    ) -> Self {
        Self {
            id,
            events,
            window,
            buffered: Bytes::new(),
            commands,
            closed,
            state: RecvState::Open,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn handle(&self) -> StreamHandle {
        StreamHandle {
            id: self.id,
            commands: self.commands.clone(),
        }
    }

    /// Abort the receive half with an application error code.
    pub fn cancel_read(&self, code: u64) {
        self.handle().cancel_read(code);
    }

    fn consumed(&self, n: usize) {
        let prev = self.window.fetch_sub(n, Ordering::AcqRel);
        if prev >= RECV_WINDOW && prev - n < RECV_WINDOW {
            let _ = self.commands.send(StreamCommand::Resume { id: self.id });
        }
    }
}

impl AsyncRead for RecvStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.buffered.is_empty() {
                let n = this.buffered.len().min(buf.remaining());
                buf.put_slice(&this.buffered[..n]);
                this.buffered.advance(n);
                this.consumed(n);
                return Poll::Ready(Ok(()));
            }

            match this.state {
                RecvState::Finished => return Poll::Ready(Ok(())),
                RecvState::Reset(code) => {
                    return Poll::Ready(Err(io_error(TransportError::StreamReset {
                        id: this.id,
                        code,
                    })))
                }
                RecvState::Open => {}
            }

            if let Some(reason) = closed_reason(&this.closed) {
                return Poll::Ready(Err(io_error(TransportError::Closed(reason))));
            }

            match this.events.poll_recv(cx) {
                Poll::Ready(Some(RecvEvent::Data(data))) => this.buffered = data,
                Poll::Ready(Some(RecvEvent::Fin)) => this.state = RecvState::Finished,
                Poll::Ready(Some(RecvEvent::Reset(code))) => this.state = RecvState::Reset(code),
                Poll::Ready(None) => {
                    let err = match closed_reason(&this.closed) {
                        Some(reason) => TransportError::Closed(reason),
                        None => TransportError::Quic(format!(
                            "stream {} is no longer readable",
                            this.id
                        )),
                    };
                    return Poll::Ready(Err(io_error(err)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Both halves of a bidirectional stream.
#[derive(Debug)]
pub struct BidiStream {
    pub send: SendStream,
    pub recv: RecvStream,
}

impl BidiStream {
    pub fn id(&self) -> StreamId {
        self.send.id
    }

    pub fn handle(&self) -> StreamHandle {
        self.send.handle()
    }

    pub fn into_parts(self) -> (SendStream, RecvStream) {
        (self.send, self.recv)
    }
}

impl AsyncRead for BidiStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

/// Build a send half with its STOP_SENDING notifier.
pub(crate) fn send_half(
    id: StreamId,
    commands: CommandTx,
    closed: ClosedRx,
) -> (SendStream, watch::Sender<Option<u64>>) {
    let (stop_tx, stop_rx) = watch::channel(None);
    (SendStream::new(id, commands, stop_rx, closed), stop_tx)
}

/// Build a receive half with the feed the transport delivers through.
pub(crate) fn recv_half(
    id: StreamId,
    commands: CommandTx,
    closed: ClosedRx,
) -> (RecvStream, RecvFeed) {
    let (tx, rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));
    let feed = RecvFeed {
        events: tx,
        buffered: Arc::clone(&buffered),
    };
    (RecvStream::new(id, rx, buffered, commands, closed), feed)
}
