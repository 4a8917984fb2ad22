//! Handling of server-initiated streams: control stream, push, QPACK and
//! unknown stream types, and the hijack callbacks.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use http::Request;
use specter_h3::h3::frame::{self, FrameType, Settings};
use specter_h3::h3::{ErrorCode, Hijack, StreamType};
use specter_h3::transport::mem::MemOptions;
use specter_h3::transport::{Connection, QuicConfig, TlsConfig};
use specter_h3::{Client, ClientOptions, Error};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

mod helpers;
use helpers::mock_dialer::MockDialer;
use helpers::mock_h3_peer::{connect, headers_frame, MockH3Peer};

const WAIT: Duration = Duration::from_secs(5);

/// Client with one completed request, so the connection is up and the
/// dispatcher is running.
async fn connected(opts: ClientOptions, mem: MemOptions) -> (Arc<Client>, MockH3Peer) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .with_test_writer()
        .try_init();

    let (conn, peer) = connect(mem);
    let client = Arc::new(
        Client::with_dialer(
            "example.com",
            TlsConfig::default(),
            QuicConfig::default(),
            opts,
            MockDialer::new(conn),
        )
        .unwrap(),
    );
    round_trip(&client, &peer).await;
    (client, peer)
}

async fn round_trip(client: &Client, peer: &MockH3Peer) {
    let server = {
        let peer = peer.clone();
        tokio::spawn(async move {
            let mut req = peer.accept_request().await;
            req.respond("200", &[], b"ok");
        })
    };
    let rsp = client
        .round_trip(Request::get("https://example.com/").body(()).unwrap())
        .await
        .unwrap();
    assert_eq!(rsp.text().await.unwrap(), "ok");
    server.await.unwrap();
}

#[tokio::test]
async fn test_client_sends_settings() {
    let opts = ClientOptions::default()
        .with_datagrams(true)
        .with_setting(0x2b, 7);
    let (_client, peer) = connected(
        opts,
        MemOptions {
            datagrams: true,
            ..Default::default()
        },
    )
    .await;

    let settings = peer.accept_control().await;
    assert!(settings.datagram);
    assert_eq!(settings.extensions.get(&0x2b), Some(&7));
}

#[tokio::test]
async fn test_extra_settings_cannot_claim_datagrams() {
    let opts = ClientOptions::default()
        .with_setting(frame::SETTING_H3_DATAGRAM, 1)
        .with_setting(0x2b, 7);
    let (_client, peer) = connected(opts, MemOptions::default()).await;

    let settings = peer.accept_control().await;
    assert!(!settings.datagram);
    assert!(!settings.extensions.contains_key(&frame::SETTING_H3_DATAGRAM));
    assert_eq!(settings.extensions.get(&0x2b), Some(&7));
}

#[tokio::test]
async fn test_default_settings_are_empty() {
    let (_client, peer) = connected(ClientOptions::default(), MemOptions::default()).await;
    assert_eq!(peer.accept_control().await, Settings::default());
}

#[tokio::test]
async fn test_server_settings_accepted() {
    let (client, peer) = connected(ClientOptions::default(), MemOptions::default()).await;

    let mut settings = Settings::default();
    settings.extensions.insert(0x6, 16_384);
    let mut control = peer.open_control(&settings).await;

    // unknown frames after SETTINGS are ignored
    let mut buf = BytesMut::new();
    frame::encode_frame(&mut buf, FrameType::Unknown(0x21), b"grease");
    control.write(buf.freeze()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    round_trip(&client, &peer).await;
}

#[tokio::test]
async fn test_control_stream_must_start_with_settings() {
    let (_client, peer) = connected(ClientOptions::default(), MemOptions::default()).await;

    let mut control = peer.open_uni(0x00).await;
    let mut buf = BytesMut::new();
    frame::encode_frame(&mut buf, FrameType::GoAway, &[0x00]);
    control.write(buf.freeze()).unwrap();

    assert_eq!(peer.closed().await.code, ErrorCode::MissingSettings.code());
}

#[tokio::test]
async fn test_duplicate_settings() {
    let (_client, peer) = connected(ClientOptions::default(), MemOptions::default()).await;

    let mut control = peer.open_control(&Settings::default()).await;
    let mut buf = BytesMut::new();
    Settings::default().encode_frame(&mut buf);
    control.write(buf.freeze()).unwrap();

    assert_eq!(peer.closed().await.code, ErrorCode::FrameUnexpected.code());
}

#[tokio::test]
async fn test_closing_control_stream() {
    let (_client, peer) = connected(ClientOptions::default(), MemOptions::default()).await;

    let mut control = peer.open_control(&Settings::default()).await;
    control.finish().unwrap();

    assert_eq!(
        peer.closed().await.code,
        ErrorCode::ClosedCriticalStream.code()
    );
}

#[tokio::test]
async fn test_datagram_mismatch() {
    let (_client, peer) = connected(
        ClientOptions::default().with_datagrams(true),
        MemOptions::default(),
    )
    .await;

    let settings = Settings {
        datagram: true,
        ..Default::default()
    };
    let _control = peer.open_control(&settings).await;

    let reason = peer.closed().await;
    assert_eq!(reason.code, ErrorCode::SettingsError.code());
    assert!(reason.reason.contains("Datagram"));
}

#[tokio::test]
async fn test_datagram_check_waits_for_handshake() {
    let (conn, peer) = connect(MemOptions {
        handshake_complete: false,
        datagrams: true,
    });
    let client = Client::with_dialer(
        "example.com",
        TlsConfig::default(),
        QuicConfig::default(),
        ClientOptions::default().with_datagrams(true),
        MockDialer::new(conn),
    )
    .unwrap();

    // early data brings the connection up before the handshake is done
    let server = {
        let peer = peer.clone();
        tokio::spawn(async move {
            let mut req = peer.accept_request().await;
            req.respond("200", &[], b"early");
        })
    };
    let req = Request::builder()
        .method("GET_0RTT")
        .uri("https://example.com/")
        .body(())
        .unwrap();
    let rsp = client.round_trip(req).await.unwrap();
    assert_eq!(rsp.text().await.unwrap(), "early");
    server.await.unwrap();

    let settings = Settings {
        datagram: true,
        ..Default::default()
    };
    let _control = peer.open_control(&settings).await;
    let early = timeout(Duration::from_millis(50), peer.conn().closed()).await;
    assert!(early.is_err(), "closed before handshake: {:?}", early);

    peer.conn().complete_handshake();
    round_trip(&client, &peer).await;
    assert!(timeout(Duration::from_millis(50), peer.conn().closed())
        .await
        .is_err());
}

#[tokio::test]
async fn test_push_stream_is_refused() {
    let (_client, peer) = connected(ClientOptions::default(), MemOptions::default()).await;

    let _push = peer.open_uni(0x01).await;

    assert_eq!(peer.closed().await.code, ErrorCode::IdError.code());
}

#[tokio::test]
async fn test_qpack_streams_are_tolerated() {
    let (client, peer) = connected(ClientOptions::default(), MemOptions::default()).await;

    let _encoder = peer.open_uni(0x02).await;
    let _decoder = peer.open_uni(0x03).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    round_trip(&client, &peer).await;
}

#[tokio::test]
async fn test_unknown_uni_stream_is_stopped() {
    let (client, peer) = connected(ClientOptions::default(), MemOptions::default()).await;

    let grease = peer.open_uni(0x21).await;
    let code = timeout(WAIT, grease.stopped()).await.unwrap().unwrap();
    assert_eq!(code, ErrorCode::StreamCreationError.code());

    round_trip(&client, &peer).await;
}

#[tokio::test]
async fn test_uni_hijacker_takes_stream() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let opts = ClientOptions::default().with_uni_stream_hijacker(move |ty, _conn, stream| {
        if ty == StreamType::Unknown(0x54) {
            let _ = tx.send(stream);
            Ok(Hijack::Taken)
        } else {
            Ok(Hijack::Declined(stream))
        }
    });
    let (_client, peer) = connected(opts, MemOptions::default()).await;

    let mut taken = peer.open_uni(0x54).await;
    taken.write_final(&b"payload"[..]).unwrap();

    let mut stream = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"payload");

    let declined = peer.open_uni(0x55).await;
    let code = timeout(WAIT, declined.stopped()).await.unwrap().unwrap();
    assert_eq!(code, ErrorCode::StreamCreationError.code());
}

#[tokio::test]
async fn test_failing_uni_hijacker_stops_stream() {
    let opts = ClientOptions::default().with_uni_stream_hijacker(|_ty, _conn, _stream| {
        Err(Error::invalid_request("no handler for stream"))
    });
    let (client, peer) = connected(opts, MemOptions::default()).await;

    let refused = peer.open_uni(0x56).await;
    let code = timeout(WAIT, refused.stopped()).await.unwrap().unwrap();
    assert_eq!(code, ErrorCode::StreamCreationError.code());

    round_trip(&client, &peer).await;
}

#[tokio::test]
async fn test_uni_hijacker_not_offered_known_types() {
    let (tx, mut rx) = mpsc::unbounded_channel::<StreamType>();
    let opts = ClientOptions::default().with_uni_stream_hijacker(move |ty, _conn, stream| {
        let _ = tx.send(ty);
        Ok(Hijack::Declined(stream))
    });
    let (_client, peer) = connected(opts, MemOptions::default()).await;

    let _control = peer.open_control(&Settings::default()).await;
    let _encoder = peer.open_uni(0x02).await;
    let grease = peer.open_uni(0x40).await;
    timeout(WAIT, grease.stopped()).await.unwrap().unwrap();

    assert_eq!(rx.recv().await, Some(StreamType::Unknown(0x40)));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_bidi_hijacker() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let opts = ClientOptions::default().with_stream_hijacker(move |ft, _conn, stream| {
        if ft == FrameType::Unknown(0x41) {
            let _ = tx.send(stream);
            Ok(Hijack::Taken)
        } else {
            Ok(Hijack::Declined(stream))
        }
    });
    let (_client, peer) = connected(opts, MemOptions::default()).await;

    let mut tunnel = peer.open_bidi().await;
    let mut buf = BytesMut::new();
    specter_h3::h3::varint::encode(0x41, &mut buf);
    buf.extend_from_slice(b"tunnel");
    tunnel.send.write(buf.freeze()).unwrap();

    let mut stream = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    let mut data = [0u8; 6];
    stream.read_exact(&mut data).await.unwrap();
    assert_eq!(&data, b"tunnel");

    stream.send.write(&b"back"[..]).unwrap();
    let mut echo = [0u8; 4];
    tunnel.recv.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"back");
}

#[tokio::test]
async fn test_unclaimed_bidi_stream_closes_connection() {
    let opts = ClientOptions::default()
        .with_stream_hijacker(|_ft, _conn, stream| Ok(Hijack::Declined(stream)));
    let (client, peer) = connected(opts, MemOptions::default()).await;
    assert_eq!(client.quic_config().max_incoming_bidi_streams, 100);

    let mut stream = peer.open_bidi().await;
    stream.send.write(headers_frame(&[(":status", "200")])).unwrap();

    assert_eq!(peer.closed().await.code, ErrorCode::FrameUnexpected.code());
}

#[tokio::test]
async fn test_failing_bidi_hijacker_closes_connection() {
    let opts = ClientOptions::default().with_stream_hijacker(|_ft, _conn, _stream| {
        Err(Error::invalid_request("tunnel refused"))
    });
    let (_client, peer) = connected(opts, MemOptions::default()).await;

    let mut stream = peer.open_bidi().await;
    let mut buf = BytesMut::new();
    specter_h3::h3::varint::encode(0x41, &mut buf);
    stream.send.write(buf.freeze()).unwrap();

    assert_eq!(peer.closed().await.code, ErrorCode::FrameUnexpected.code());
}

#[tokio::test]
async fn test_bidi_stream_ending_inside_frame_header_closes_connection() {
    let opts = ClientOptions::default()
        .with_stream_hijacker(|_ft, _conn, stream| Ok(Hijack::Declined(stream)));
    let (_client, peer) = connected(opts, MemOptions::default()).await;

    // HEADERS type, then FIN before the length
    let mut stream = peer.open_bidi().await;
    stream.send.write_final(&[0x01][..]).unwrap();

    assert_eq!(peer.closed().await.code, ErrorCode::FrameUnexpected.code());
}
