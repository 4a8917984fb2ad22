//! quiche-backed QUIC transport.
//!
//! [`QuicheDialer`] resolves the authority, binds a UDP socket and spawns a
//! driver task that owns the `quiche::Connection`. Everything else talks to
//! the driver over channels, so handles and streams are `Send` and cheap to
//! share.

mod driver;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use self::driver::{Driver, DriverChannels, DriverCommand};
use super::{
    BidiStream, CloseReason, Connection, ConnectionInfo, Dialer, QuicConfig, RecvStream,
    SendStream, TlsConfig, TransportError, QUIC_VERSION_1,
};

/// Largest UDP payload we are willing to receive.
const MAX_RECV_UDP_PAYLOAD: usize = 65535;

/// Dials QUIC connections with quiche.
#[derive(Debug, Clone, Default)]
pub struct QuicheDialer;

impl QuicheDialer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for QuicheDialer {
    async fn dial(
        &self,
        authority: &str,
        tls: &TlsConfig,
        quic: &QuicConfig,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let mut config = build_config(tls, quic)?;

        let peer_addr = tokio::net::lookup_host(authority)
            .await
            .map_err(|e| TransportError::Dial(format!("DNS resolve failed: {}", e)))?
            .next()
            .ok_or_else(|| TransportError::Dial(format!("no address for {}", authority)))?;

        let bind_addr: SocketAddr = if peer_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| TransportError::Dial(format!("UDP bind failed: {}", e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TransportError::Dial(e.to_string()))?;

        let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
        getrandom::fill(&mut scid).map_err(|e| TransportError::Dial(format!("RNG error: {}", e)))?;
        let scid = quiche::ConnectionId::from_ref(&scid);

        let server_name = tls
            .server_name
            .clone()
            .unwrap_or_else(|| host_of(authority).to_string());
        let conn = quiche::connect(
            Some(&server_name),
            &scid,
            local_addr,
            peer_addr,
            &mut config,
        )
        .map_err(|e| TransportError::Dial(format!("connect failed: {}", e)))?;

        tracing::debug!(%authority, %peer_addr, %local_addr, "QUIC connection started");
        Ok(Arc::new(QuicConnection::spawn(
            conn,
            socket,
            local_addr,
            peer_addr,
            server_name,
        )))
    }
}

/// Host part of an authority, without brackets around IPv6 literals.
fn host_of(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match authority.rsplit_once(':') {
        Some((host, _)) => host,
        None => authority,
    }
}

/// Translate our settings into a quiche configuration.
pub fn build_config(tls: &TlsConfig, quic: &QuicConfig) -> Result<quiche::Config, TransportError> {
    let config_err = |e: quiche::Error| TransportError::Config(e.to_string());

    let version = quic.versions.first().copied().unwrap_or(QUIC_VERSION_1);
    let mut config = quiche::Config::new(version).map_err(config_err)?;

    let alpn: Vec<&[u8]> = tls.alpn.iter().map(|p| p.as_bytes()).collect();
    config.set_application_protos(&alpn).map_err(config_err)?;
    config.verify_peer(tls.verify_peer);
    if let Some(ca_file) = &tls.ca_file {
        let path = ca_file
            .to_str()
            .ok_or_else(|| TransportError::Config("CA file path is not UTF-8".into()))?;
        config
            .load_verify_locations_from_file(path)
            .map_err(config_err)?;
    }
    if tls.enable_early_data {
        config.enable_early_data();
    }

    config.set_max_idle_timeout(quic.max_idle_timeout.as_millis() as u64);
    config.set_max_recv_udp_payload_size(MAX_RECV_UDP_PAYLOAD);
    config.set_max_send_udp_payload_size(quic.max_send_udp_payload_size);
    config.set_initial_max_data(quic.initial_max_data);
    config.set_initial_max_stream_data_bidi_local(quic.initial_max_stream_data);
    config.set_initial_max_stream_data_bidi_remote(quic.initial_max_stream_data);
    config.set_initial_max_stream_data_uni(quic.initial_max_stream_data);
    config.set_initial_max_streams_bidi(quic.max_incoming_bidi_streams);
    config.set_initial_max_streams_uni(quic.max_incoming_uni_streams);
    config.set_disable_active_migration(true);
    if quic.enable_datagrams {
        config.enable_dgram(true, 1024, 1024);
    }

    Ok(config)
}

/// Handle to a connection owned by a driver task.
pub struct QuicConnection {
    commands: mpsc::UnboundedSender<DriverCommand>,
    accept_bidi: Mutex<mpsc::UnboundedReceiver<BidiStream>>,
    accept_uni: Mutex<mpsc::UnboundedReceiver<RecvStream>>,
    closed: watch::Receiver<Option<CloseReason>>,
    info: watch::Receiver<ConnectionInfo>,
}

impl QuicConnection {
    fn spawn(
        conn: quiche::Connection,
        socket: UdpSocket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        server_name: String,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (bidi_tx, bidi_rx) = mpsc::unbounded_channel();
        let (uni_tx, uni_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(None);
        let (info_tx, info_rx) = watch::channel(ConnectionInfo {
            server_name,
            ..Default::default()
        });

        let driver = Driver::new(
            conn,
            socket,
            local_addr,
            peer_addr,
            DriverChannels {
                commands: command_rx,
                accept_bidi: bidi_tx,
                accept_uni: uni_tx,
                closed: closed_tx,
                info: info_tx,
            },
        );
        tokio::spawn(driver.drive());

        Self {
            commands: command_tx,
            accept_bidi: Mutex::new(bidi_rx),
            accept_uni: Mutex::new(uni_rx),
            closed: closed_rx,
            info: info_rx,
        }
    }

    fn closed_err(&self) -> TransportError {
        TransportError::Closed(
            self.closed
                .borrow()
                .clone()
                .unwrap_or_else(driver_gone),
        )
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, TransportError>>) -> DriverCommand,
    ) -> Result<T, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| self.closed_err())?;
        rx.await.map_err(|_| self.closed_err())?
    }

    async fn accept<T>(&self, queue: &Mutex<mpsc::UnboundedReceiver<T>>) -> Result<T, TransportError> {
        let mut queue = queue.lock().await;
        queue.recv().await.ok_or_else(|| self.closed_err())
    }
}

fn driver_gone() -> CloseReason {
    CloseReason {
        code: 0,
        reason: "connection driver stopped".into(),
        remote: false,
    }
}

#[async_trait]
impl Connection for QuicConnection {
    async fn open_bidi_stream(&self) -> Result<BidiStream, TransportError> {
        self.request(DriverCommand::OpenBidi).await
    }

    async fn open_uni_stream(&self) -> Result<SendStream, TransportError> {
        self.request(DriverCommand::OpenUni).await
    }

    async fn accept_bidi_stream(&self) -> Result<BidiStream, TransportError> {
        self.accept(&self.accept_bidi).await
    }

    async fn accept_uni_stream(&self) -> Result<RecvStream, TransportError> {
        self.accept(&self.accept_uni).await
    }

    async fn handshake_complete(&self) -> Result<(), TransportError> {
        let mut info = self.info.clone();
        let mut closed = self.closed.clone();
        tokio::select! {
            biased;
            res = info.wait_for(|i| i.handshake_complete) => res
                .map(|_| ())
                .map_err(|_| self.closed_err()),
            Ok(reason) = closed.wait_for(Option::is_some) => {
                let reason = reason.clone().unwrap_or_else(driver_gone);
                Err(TransportError::Handshake(reason.to_string()))
            }
        }
    }

    fn close(&self, code: u64, reason: &str) {
        let _ = self.commands.send(DriverCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }

    async fn closed(&self) -> CloseReason {
        let mut closed = self.closed.clone();
        let reason = match closed.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_else(driver_gone),
            Err(_) => driver_gone(),
        };
        reason
    }

    fn info(&self) -> ConnectionInfo {
        self.info.borrow().clone()
    }
}
