//! In-process transport: two connected endpoints with QUIC stream semantics.
//!
//! Streams get real QUIC ids, half-close, RESET_STREAM and STOP_SENDING
//! behave like their wire counterparts, and closing either endpoint fails
//! every stream on both. There is no flow control and no stream limit.
//!
//! ```no_run
//! # async fn demo() {
//! let (client, server) = specter_h3::transport::mem::pair();
//! # let _ = (client, server);
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::stream::{self, RecvEvent, RecvFeed, StreamCommand};
use super::{
    stream_id, BidiStream, CloseReason, Connection, ConnectionInfo, RecvStream, SendStream,
    StreamId, TransportError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Side {
    Client = 0,
    Server = 1,
}

impl Side {
    fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }

    fn idx(self) -> usize {
        self as usize
    }
}

/// Knobs for [`pair_with`].
#[derive(Debug, Clone, Copy)]
pub struct MemOptions {
    /// Start with the handshake already complete.
    pub handshake_complete: bool,
    /// Report QUIC DATAGRAM support in [`ConnectionInfo`] once the handshake
    /// is complete.
    pub datagrams: bool,
}

impl Default for MemOptions {
    fn default() -> Self {
        Self {
            handshake_complete: true,
            datagrams: false,
        }
    }
}

#[derive(Default)]
struct State {
    /// Feeds for receive halves, keyed by the side that reads.
    inbound: HashMap<(Side, StreamId), RecvFeed>,
    /// STOP_SENDING notifiers, keyed by the side that writes.
    stoppers: HashMap<(Side, StreamId), watch::Sender<Option<u64>>>,
    next_bidi: [u64; 2],
    next_uni: [u64; 2],
    commands: [Option<mpsc::UnboundedSender<StreamCommand>>; 2],
    accept_bidi: [Option<mpsc::UnboundedSender<BidiStream>>; 2],
    accept_uni: [Option<mpsc::UnboundedSender<RecvStream>>; 2],
}

struct Shared {
    state: Mutex<State>,
    closed: [watch::Sender<Option<CloseReason>>; 2],
    handshake: watch::Sender<bool>,
    options: MemOptions,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close_reason(&self, side: Side) -> Option<CloseReason> {
        self.closed[side.idx()].borrow().clone()
    }

    fn route(&self, from: Side, cmd: StreamCommand) {
        let mut state = self.lock();
        match cmd {
            StreamCommand::Write { id, data, fin } => {
                let key = (from.peer(), id);
                if let Some(tx) = state.inbound.get(&key) {
                    if !data.is_empty() {
                        let _ = tx.send(RecvEvent::Data(data));
                    }
                    if fin {
                        let _ = tx.send(RecvEvent::Fin);
                    }
                }
                if fin {
                    state.inbound.remove(&key);
                    state.stoppers.remove(&(from, id));
                }
            }
            StreamCommand::Reset { id, code } => {
                if let Some(tx) = state.inbound.remove(&(from.peer(), id)) {
                    let _ = tx.send(RecvEvent::Reset(code));
                }
                state.stoppers.remove(&(from, id));
            }
            StreamCommand::StopSending { id, code } => {
                state.inbound.remove(&(from, id));
                if let Some(stop) = state.stoppers.remove(&(from.peer(), id)) {
                    let _ = stop.send(Some(code));
                }
            }
            // writes are delivered immediately, nothing is held back
            StreamCommand::Resume { .. } => {}
        }
    }

    fn close(&self, side: Side, code: u64, reason: &str) {
        let mut state = self.lock();
        if self.close_reason(side).is_some() {
            return;
        }
        for s in [side, side.peer()] {
            self.closed[s.idx()].send_replace(Some(CloseReason {
                code,
                reason: reason.to_string(),
                remote: s != side,
            }));
        }
        state.inbound.clear();
        state.stoppers.clear();
        state.commands = [None, None];
        state.accept_bidi = [None, None];
        state.accept_uni = [None, None];
    }
}

/// One endpoint of an in-memory connection.
pub struct MemConnection {
    side: Side,
    shared: Arc<Shared>,
    accept_bidi: tokio::sync::Mutex<mpsc::UnboundedReceiver<BidiStream>>,
    accept_uni: tokio::sync::Mutex<mpsc::UnboundedReceiver<RecvStream>>,
}

/// Build a connected client/server pair with default options.
///
/// Must be called from within a Tokio runtime.
pub fn pair() -> (MemConnection, MemConnection) {
    pair_with(MemOptions::default())
}

pub fn pair_with(options: MemOptions) -> (MemConnection, MemConnection) {
    let (client_cmd_tx, client_cmd_rx) = mpsc::unbounded_channel();
    let (server_cmd_tx, server_cmd_rx) = mpsc::unbounded_channel();
    let (client_bidi_tx, client_bidi_rx) = mpsc::unbounded_channel();
    let (server_bidi_tx, server_bidi_rx) = mpsc::unbounded_channel();
    let (client_uni_tx, client_uni_rx) = mpsc::unbounded_channel();
    let (server_uni_tx, server_uni_rx) = mpsc::unbounded_channel();

    let state = State {
        commands: [Some(client_cmd_tx), Some(server_cmd_tx)],
        accept_bidi: [Some(client_bidi_tx), Some(server_bidi_tx)],
        accept_uni: [Some(client_uni_tx), Some(server_uni_tx)],
        ..Default::default()
    };
    let shared = Arc::new(Shared {
        state: Mutex::new(state),
        closed: [watch::channel(None).0, watch::channel(None).0],
        handshake: watch::channel(options.handshake_complete).0,
        options,
    });

    spawn_router(&shared, Side::Client, client_cmd_rx);
    spawn_router(&shared, Side::Server, server_cmd_rx);

    let client = MemConnection {
        side: Side::Client,
        shared: shared.clone(),
        accept_bidi: tokio::sync::Mutex::new(client_bidi_rx),
        accept_uni: tokio::sync::Mutex::new(client_uni_rx),
    };
    let server = MemConnection {
        side: Side::Server,
        shared,
        accept_bidi: tokio::sync::Mutex::new(server_bidi_rx),
        accept_uni: tokio::sync::Mutex::new(server_uni_rx),
    };
    (client, server)
}

fn spawn_router(
    shared: &Arc<Shared>,
    side: Side,
    mut commands: mpsc::UnboundedReceiver<StreamCommand>,
) {
    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        while let Some(cmd) = commands.recv().await {
            let Some(shared) = weak.upgrade() else { break };
            shared.route(side, cmd);
        }
        tracing::trace!(?side, "mem transport router stopped");
    });
}

impl MemConnection {
    /// Mark the handshake complete on both endpoints.
    pub fn complete_handshake(&self) {
        self.shared.handshake.send_replace(true);
    }

    fn closed_err(&self) -> TransportError {
        TransportError::Closed(self.shared.close_reason(self.side).unwrap_or_else(|| {
            CloseReason {
                code: 0,
                reason: "transport shut down".into(),
                remote: false,
            }
        }))
    }

    fn open(&self, uni: bool) -> Result<BidiStream, TransportError> {
        let shared = &self.shared;
        let mut state = shared.lock();
        let (Some(local_cmds), Some(peer_cmds)) = (
            state.commands[self.side.idx()].clone(),
            state.commands[self.side.peer().idx()].clone(),
        ) else {
            return Err(self.closed_err());
        };

        let me = self.side;
        let peer = me.peer();
        let counter = if uni {
            &mut state.next_uni[me.idx()]
        } else {
            &mut state.next_bidi[me.idx()]
        };
        let id = stream_id::nth(*counter, me == Side::Server, uni);
        *counter += 1;

        let local_closed = shared.closed[me.idx()].subscribe();
        let peer_closed = shared.closed[peer.idx()].subscribe();

        // local -> peer direction, always present
        let (local_send, local_stop) = stream::send_half(id, local_cmds.clone(), local_closed.clone());
        let (peer_recv, peer_feed) = stream::recv_half(id, peer_cmds.clone(), peer_closed.clone());
        state.stoppers.insert((me, id), local_stop);
        state.inbound.insert((peer, id), peer_feed);

        // peer -> local direction; for uni streams it exists but is never fed
        let (peer_send, peer_stop) = stream::send_half(id, peer_cmds, peer_closed);
        let (local_recv, local_feed) = stream::recv_half(id, local_cmds, local_closed);
        if !uni {
            state.stoppers.insert((peer, id), peer_stop);
            state.inbound.insert((me, id), local_feed);
        }

        let local = BidiStream {
            send: local_send,
            recv: local_recv,
        };
        let remote = BidiStream {
            send: peer_send,
            recv: peer_recv,
        };

        if uni {
            if let Some(tx) = &state.accept_uni[peer.idx()] {
                let _ = tx.send(remote.recv);
            }
        } else if let Some(tx) = &state.accept_bidi[peer.idx()] {
            let _ = tx.send(remote);
        }
        Ok(local)
    }

    async fn accept<T>(
        &self,
        queue: &tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
    ) -> Result<T, TransportError> {
        let mut queue = queue.lock().await;
        tokio::select! {
            biased;
            _ = self.closed() => Err(self.closed_err()),
            item = queue.recv() => item.ok_or_else(|| self.closed_err()),
        }
    }
}

#[async_trait]
impl Connection for MemConnection {
    async fn open_bidi_stream(&self) -> Result<BidiStream, TransportError> {
        self.open(false)
    }

    async fn open_uni_stream(&self) -> Result<SendStream, TransportError> {
        self.open(true).map(|local| local.send)
    }

    async fn accept_bidi_stream(&self) -> Result<BidiStream, TransportError> {
        self.accept(&self.accept_bidi).await
    }

    async fn accept_uni_stream(&self) -> Result<RecvStream, TransportError> {
        self.accept(&self.accept_uni).await
    }

    async fn handshake_complete(&self) -> Result<(), TransportError> {
        let mut handshake = self.shared.handshake.subscribe();
        tokio::select! {
            biased;
            reason = self.closed() => Err(if *self.shared.handshake.borrow() {
                TransportError::Closed(reason)
            } else {
                TransportError::Handshake(reason.to_string())
            }),
            res = handshake.wait_for(|done| *done) => res
                .map(|_| ())
                .map_err(|_| self.closed_err()),
        }
    }

    fn close(&self, code: u64, reason: &str) {
        self.shared.close(self.side, code, reason);
    }

    async fn closed(&self) -> CloseReason {
        let mut closed = self.shared.closed[self.side.idx()].subscribe();
        if let Ok(reason) = closed.wait_for(Option::is_some).await {
            if let Some(reason) = reason.clone() {
                return reason;
            }
        }
        std::future::pending().await
    }

    fn info(&self) -> ConnectionInfo {
        let handshake_complete = *self.shared.handshake.borrow();
        ConnectionInfo {
            handshake_complete,
            alpn: if handshake_complete {
                b"h3".to_vec()
            } else {
                Vec::new()
            },
            server_name: "localhost".into(),
            peer_certificate: None,
            supports_datagrams: handshake_complete && self.shared.options.datagrams,
        }
    }
}
