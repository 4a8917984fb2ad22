//! QUIC connection driver: background task that owns the quiche connection
//! and UDP socket.
//!
//! Each loop iteration flushes egress, then waits for whichever comes first:
//! a command from a connection handle, a stream operation, an incoming
//! datagram, or the quiche timer.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;

use crate::transport::stream::{self, RecvEvent, RecvFeed, StreamCommand};
use crate::transport::{
    stream_id, BidiStream, CloseReason, ConnectionInfo, RecvStream, SendStream, StreamId,
    TransportError,
};

/// Outgoing datagram buffer; quiche never produces more than the configured
/// send payload size.
const MAX_DATAGRAM_SIZE: usize = 1350;

const DEFAULT_URGENCY: u8 = 127;

/// Command sent from a connection handle to the driver.
pub enum DriverCommand {
    OpenBidi(oneshot::Sender<Result<BidiStream, TransportError>>),
    OpenUni(oneshot::Sender<Result<SendStream, TransportError>>),
    Close { code: u64, reason: String },
}

/// Channels linking the driver to its [`QuicConnection`](super::QuicConnection).
pub struct DriverChannels {
    pub commands: mpsc::UnboundedReceiver<DriverCommand>,
    pub accept_bidi: mpsc::UnboundedSender<BidiStream>,
    pub accept_uni: mpsc::UnboundedSender<RecvStream>,
    pub closed: watch::Sender<Option<CloseReason>>,
    pub info: watch::Sender<ConnectionInfo>,
}

/// Per-stream state tracked by the driver.
#[derive(Default)]
struct StreamState {
    /// Feed for the local receive half; `None` once finished or abandoned.
    feed: Option<RecvFeed>,
    /// STOP_SENDING notifier for the local send half.
    stopper: Option<watch::Sender<Option<u64>>>,
    /// Writes not yet accepted by quiche.
    outbound: VecDeque<(Bytes, bool)>,
    send_closed: bool,
}

impl StreamState {
    fn is_done(&self) -> bool {
        self.feed.is_none() && self.send_closed
    }
}

pub struct Driver {
    conn: quiche::Connection,
    socket: UdpSocket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    channels: DriverChannels,
    stream_tx: mpsc::UnboundedSender<StreamCommand>,
    stream_rx: mpsc::UnboundedReceiver<StreamCommand>,
    streams: HashMap<StreamId, StreamState>,
    pending_bidi: VecDeque<oneshot::Sender<Result<BidiStream, TransportError>>>,
    pending_uni: VecDeque<oneshot::Sender<Result<SendStream, TransportError>>>,
    opened_bidi: u64,
    opened_uni: u64,
    established: bool,
    local_close: Option<CloseReason>,
}

impl Driver {
    pub fn new(
        conn: quiche::Connection,
        socket: UdpSocket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        channels: DriverChannels,
    ) -> Self {
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        Self {
            conn,
            socket,
            local_addr,
            peer_addr,
            channels,
            stream_tx,
            stream_rx,
            streams: HashMap::new(),
            pending_bidi: VecDeque::new(),
            pending_uni: VecDeque::new(),
            opened_bidi: 0,
            opened_uni: 0,
            established: false,
            local_close: None,
        }
    }

    pub async fn drive(mut self) {
        let mut buf = vec![0u8; 65535];
        let mut out = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            if let Err(e) = self.flush_egress(&mut out).await {
                tracing::warn!("QUIC socket send error: {}", e);
                self.local_close.get_or_insert_with(|| CloseReason {
                    code: 0,
                    reason: format!("socket error: {}", e),
                    remote: false,
                });
                break;
            }
            if self.local_close.is_some() || self.conn.is_closed() {
                break;
            }

            let timeout = self.conn.timeout().unwrap_or(Duration::from_secs(60));

            tokio::select! {
                cmd = self.channels.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    // every handle dropped
                    None => self.close(0, "client shutdown"),
                },

                Some(cmd) = self.stream_rx.recv() => self.handle_stream_command(cmd, &mut buf),

                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((len, from)) => {
                        if from == self.peer_addr {
                            let info = quiche::RecvInfo {
                                from,
                                to: self.local_addr,
                            };
                            match self.conn.recv(&mut buf[..len], info) {
                                Ok(_) | Err(quiche::Error::Done) => {}
                                Err(e) => tracing::warn!("QUIC recv error: {}", e),
                            }
                            self.after_io(&mut buf);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("QUIC socket recv error: {}", e);
                        self.close(0, "socket error");
                    }
                },

                _ = sleep(timeout) => {
                    self.conn.on_timeout();
                    self.after_io(&mut buf);
                }
            }
        }

        // Flush CONNECTION_CLOSE for a local close.
        let _ = self.flush_egress(&mut out).await;
        self.shutdown();
    }

    async fn flush_egress(&mut self, out: &mut [u8]) -> std::io::Result<()> {
        loop {
            match self.conn.send(out) {
                Ok((len, send_info)) => {
                    self.socket.send_to(&out[..len], send_info.to).await?;
                }
                Err(quiche::Error::Done) => return Ok(()),
                Err(e) => {
                    tracing::warn!("QUIC send error: {}", e);
                    return Ok(());
                }
            }
        }
    }

    fn after_io(&mut self, buf: &mut [u8]) {
        self.update_handshake();
        self.process_readable(buf);
        self.process_writable();
        self.open_pending();
    }

    fn update_handshake(&mut self) {
        if self.established || !self.conn.is_established() {
            return;
        }
        self.established = true;
        let alpn = self.conn.application_proto().to_vec();
        let peer_certificate = self.conn.peer_cert().map(<[u8]>::to_vec);
        let supports_datagrams = self.conn.dgram_max_writable_len().is_some();
        tracing::debug!(
            alpn = %String::from_utf8_lossy(&alpn),
            supports_datagrams,
            "QUIC handshake complete"
        );
        self.channels.info.send_modify(|info| {
            info.handshake_complete = true;
            info.alpn = alpn;
            info.peer_certificate = peer_certificate;
            info.supports_datagrams = supports_datagrams;
        });
    }

    fn handle_command(&mut self, cmd: DriverCommand) {
        match cmd {
            DriverCommand::OpenBidi(reply) => {
                self.pending_bidi.push_back(reply);
                self.open_pending();
            }
            DriverCommand::OpenUni(reply) => {
                self.pending_uni.push_back(reply);
                self.open_pending();
            }
            DriverCommand::Close { code, reason } => self.close(code, &reason),
        }
    }

    fn close(&mut self, code: u64, reason: &str) {
        if self.local_close.is_some() {
            return;
        }
        match self.conn.close(true, code, reason.as_bytes()) {
            Ok(()) | Err(quiche::Error::Done) => {}
            Err(e) => tracing::debug!("QUIC close error: {}", e),
        }
        self.local_close = Some(CloseReason {
            code,
            reason: reason.to_string(),
            remote: false,
        });
    }

    fn closed_rx(&self) -> watch::Receiver<Option<CloseReason>> {
        self.channels.closed.subscribe()
    }

    /// Allocate streams for queued open requests while the peer grants credit.
    fn open_pending(&mut self) {
        while let Some(reply) = self.pending_bidi.pop_front() {
            if reply.is_closed() {
                continue;
            }
            let id = stream_id::nth(self.opened_bidi, false, false);
            match self.conn.stream_priority(id, DEFAULT_URGENCY, true) {
                Ok(()) => {
                    self.opened_bidi += 1;
                    let (send, stopper) = stream::send_half(id, self.stream_tx.clone(), self.closed_rx());
                    let (recv, feed) = stream::recv_half(id, self.stream_tx.clone(), self.closed_rx());
                    self.streams.insert(
                        id,
                        StreamState {
                            feed: Some(feed),
                            stopper: Some(stopper),
                            ..Default::default()
                        },
                    );
                    if let Err(Ok(stream)) = reply.send(Ok(BidiStream { send, recv })) {
                        // opener went away in the meantime
                        let (mut send, recv) = stream.into_parts();
                        recv.cancel_read(0);
                        send.cancel_write(0);
                    }
                }
                Err(quiche::Error::StreamLimit) => {
                    self.pending_bidi.push_front(reply);
                    break;
                }
                Err(e) => {
                    let _ = reply.send(Err(TransportError::Quic(e.to_string())));
                }
            }
        }

        while let Some(reply) = self.pending_uni.pop_front() {
            if reply.is_closed() {
                continue;
            }
            let id = stream_id::nth(self.opened_uni, false, true);
            match self.conn.stream_priority(id, DEFAULT_URGENCY, true) {
                Ok(()) => {
                    self.opened_uni += 1;
                    let (send, stopper) = stream::send_half(id, self.stream_tx.clone(), self.closed_rx());
                    self.streams.insert(
                        id,
                        StreamState {
                            stopper: Some(stopper),
                            ..Default::default()
                        },
                    );
                    let _ = reply.send(Ok(send));
                }
                Err(quiche::Error::StreamLimit) => {
                    self.pending_uni.push_front(reply);
                    break;
                }
                Err(e) => {
                    let _ = reply.send(Err(TransportError::Quic(e.to_string())));
                }
            }
        }
    }

    /// Register a stream the peer opened and hand it to the accept queue.
    fn accept_peer_stream(&mut self, id: StreamId) {
        let (recv, feed) = stream::recv_half(id, self.stream_tx.clone(), self.closed_rx());
        if stream_id::is_bidi(id) {
            let (send, stopper) = stream::send_half(id, self.stream_tx.clone(), self.closed_rx());
            self.streams.insert(
                id,
                StreamState {
                    feed: Some(feed),
                    stopper: Some(stopper),
                    ..Default::default()
                },
            );
            let _ = self.channels.accept_bidi.send(BidiStream { send, recv });
        } else {
            self.streams.insert(
                id,
                StreamState {
                    feed: Some(feed),
                    send_closed: true,
                    ..Default::default()
                },
            );
            let _ = self.channels.accept_uni.send(recv);
        }
    }

    fn process_readable(&mut self, buf: &mut [u8]) {
        let readable: Vec<StreamId> = self.conn.readable().collect();
        for id in readable {
            if !self.streams.contains_key(&id) && !stream_id::is_client_initiated(id) {
                self.accept_peer_stream(id);
            }
            self.read_stream(id, buf);
        }
    }

    fn read_stream(&mut self, id: StreamId, buf: &mut [u8]) {
        let mut orphan = None;
        let feed = match self.streams.get_mut(&id) {
            Some(state) => &mut state.feed,
            None => &mut orphan,
        };
        pump_stream(&mut self.conn, id, buf, feed);
        self.gc(id);
    }

    fn process_writable(&mut self) {
        let writable: Vec<StreamId> = self.conn.writable().collect();
        for id in writable {
            let has_outbound = self
                .streams
                .get(&id)
                .is_some_and(|s| !s.outbound.is_empty());
            if has_outbound {
                self.flush_stream(id);
            } else if let Err(quiche::Error::StreamStopped(code)) = self.conn.stream_writable(id, 0) {
                self.on_stopped(id, code);
            }
            self.gc(id);
        }
    }

    fn handle_stream_command(&mut self, cmd: StreamCommand, buf: &mut [u8]) {
        let id = match &cmd {
            StreamCommand::Write { id, .. }
            | StreamCommand::Reset { id, .. }
            | StreamCommand::StopSending { id, .. }
            | StreamCommand::Resume { id } => *id,
        };
        match cmd {
            StreamCommand::Write { id, data, fin } => {
                let Some(state) = self.streams.get_mut(&id) else { return };
                if state.send_closed {
                    return;
                }
                state.outbound.push_back((data, fin));
                self.flush_stream(id);
            }
            StreamCommand::Reset { id, code } => {
                if let Some(state) = self.streams.get_mut(&id) {
                    state.outbound.clear();
                    state.send_closed = true;
                    state.stopper = None;
                }
                let _ = self.conn.stream_shutdown(id, quiche::Shutdown::Write, code);
            }
            StreamCommand::StopSending { id, code } => {
                if let Some(state) = self.streams.get_mut(&id) {
                    state.feed = None;
                }
                let _ = self.conn.stream_shutdown(id, quiche::Shutdown::Read, code);
            }
            StreamCommand::Resume { id } => {
                self.read_stream(id, buf);
                return;
            }
        }
        self.gc(id);
    }

    fn flush_stream(&mut self, id: StreamId) {
        let Some(state) = self.streams.get_mut(&id) else { return };
        let mut stopped = None;
        while let Some((data, fin)) = state.outbound.front_mut() {
            match self.conn.stream_send(id, &data[..], *fin) {
                Ok(n) if n == data.len() => {
                    if *fin {
                        state.send_closed = true;
                    }
                    state.outbound.pop_front();
                }
                Ok(n) => {
                    data.advance(n);
                    break;
                }
                Err(quiche::Error::Done) => break,
                Err(quiche::Error::StreamStopped(code)) => {
                    stopped = Some(code);
                    break;
                }
                Err(e) => {
                    tracing::debug!(stream = id, "QUIC stream_send error: {}", e);
                    state.outbound.clear();
                    state.send_closed = true;
                    break;
                }
            }
        }
        if let Some(code) = stopped {
            self.on_stopped(id, code);
        }
    }

    fn on_stopped(&mut self, id: StreamId, code: u64) {
        if let Some(state) = self.streams.get_mut(&id) {
            state.outbound.clear();
            state.send_closed = true;
            if let Some(stopper) = state.stopper.take() {
                let _ = stopper.send(Some(code));
            }
        }
    }

    fn gc(&mut self, id: StreamId) {
        if self.streams.get(&id).is_some_and(StreamState::is_done) {
            self.streams.remove(&id);
        }
    }

    /// Publish the close reason and fail everything still attached.
    fn shutdown(&mut self) {
        let reason = self.local_close.clone().unwrap_or_else(|| self.remote_close_reason());
        tracing::debug!(%reason, "QUIC connection closed");
        self.channels.closed.send_replace(Some(reason.clone()));

        // dropping the feeds and stoppers wakes every stream half
        self.streams.clear();
        for reply in self.pending_bidi.drain(..) {
            let _ = reply.send(Err(TransportError::Closed(reason.clone())));
        }
        for reply in self.pending_uni.drain(..) {
            let _ = reply.send(Err(TransportError::Closed(reason.clone())));
        }
    }

    fn remote_close_reason(&self) -> CloseReason {
        if let Some(err) = self.conn.peer_error() {
            return CloseReason {
                code: err.error_code,
                reason: String::from_utf8_lossy(&err.reason).into_owned(),
                remote: true,
            };
        }
        if let Some(err) = self.conn.local_error() {
            return CloseReason {
                code: err.error_code,
                reason: String::from_utf8_lossy(&err.reason).into_owned(),
                remote: false,
            };
        }
        let reason = if self.conn.is_timed_out() {
            "idle timeout"
        } else {
            "connection closed"
        };
        CloseReason {
            code: 0,
            reason: reason.into(),
            remote: false,
        }
    }
}

/// Receive side of a QUIC connection as seen by [`pump_stream`].
trait StreamSource {
    fn stream_recv(&mut self, id: StreamId, buf: &mut [u8]) -> quiche::Result<(usize, bool)>;
}

impl StreamSource for quiche::Connection {
    fn stream_recv(&mut self, id: StreamId, buf: &mut [u8]) -> quiche::Result<(usize, bool)> {
        quiche::Connection::stream_recv(self, id, buf)
    }
}

/// Move readable bytes of stream `id` into its feed.
///
/// Stops once the feed holds [`stream::RECV_WINDOW`] unread bytes; the rest
/// stays with quiche, which then withholds flow-control credit from the
/// peer until the reader catches up and sends `Resume`. Data for a missing
/// or abandoned feed is read and discarded.
fn pump_stream<S: StreamSource>(
    source: &mut S,
    id: StreamId,
    buf: &mut [u8],
    feed: &mut Option<RecvFeed>,
) {
    loop {
        if feed.as_ref().is_some_and(RecvFeed::is_closed) {
            *feed = None;
        }
        if feed.as_ref().is_some_and(RecvFeed::is_full) {
            tracing::trace!(stream = id, "receive window full, deferring read");
            return;
        }
        let event = match source.stream_recv(id, buf) {
            Ok((len, fin)) => {
                if len > 0 {
                    if let Some(f) = feed.as_ref() {
                        f.send(RecvEvent::Data(Bytes::copy_from_slice(&buf[..len])));
                    }
                }
                if !fin {
                    continue;
                }
                RecvEvent::Fin
            }
            Err(quiche::Error::Done) => return,
            Err(quiche::Error::StreamReset(code)) => RecvEvent::Reset(code),
            Err(e) => {
                tracing::debug!(stream = id, "QUIC stream_recv error: {}", e);
                RecvEvent::Reset(0)
            }
        };
        if let Some(f) = feed.take() {
            f.send(event);
        }
        return;
    }
}
