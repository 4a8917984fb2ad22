//! Scripted HTTP/3 server endpoint on top of the in-memory transport.
//!
//! The peer speaks raw frames so tests can send exactly the bytes a
//! misbehaving server would.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use specter_h3::h3::frame::{self, Frame, FrameType, Settings};
use specter_h3::h3::qpack::{Decoder, Encoder, HeaderField};
use specter_h3::h3::varint;
use specter_h3::transport::mem::{self, MemConnection, MemOptions};
use specter_h3::transport::{BidiStream, CloseReason, Connection, SendStream};
use tokio::io::AsyncReadExt;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct MockH3Peer {
    conn: Arc<MemConnection>,
}

/// Build a client connection and the scripted peer on its other end.
pub fn connect(options: MemOptions) -> (Arc<dyn Connection>, MockH3Peer) {
    let (client, server) = mem::pair_with(options);
    let client: Arc<dyn Connection> = Arc::new(client);
    (
        client,
        MockH3Peer {
            conn: Arc::new(server),
        },
    )
}

#[allow(dead_code)]
impl MockH3Peer {
    pub fn conn(&self) -> &MemConnection {
        &self.conn
    }

    /// Open a unidirectional stream and write its type.
    pub async fn open_uni(&self, stream_type: u64) -> SendStream {
        let mut send = self.conn.open_uni_stream().await.unwrap();
        let mut buf = BytesMut::new();
        varint::encode(stream_type, &mut buf);
        send.write(buf.freeze()).unwrap();
        send
    }

    /// Open the control stream and send SETTINGS on it.
    pub async fn open_control(&self, settings: &Settings) -> SendStream {
        let mut send = self.open_uni(0x00).await;
        let mut buf = BytesMut::new();
        settings.encode_frame(&mut buf);
        send.write(buf.freeze()).unwrap();
        send
    }

    pub async fn open_bidi(&self) -> BidiStream {
        self.conn.open_bidi_stream().await.unwrap()
    }

    /// Read the client's control stream up to its SETTINGS frame.
    pub async fn accept_control(&self) -> Settings {
        let mut recv = tokio::time::timeout(WAIT, self.conn.accept_uni_stream())
            .await
            .expect("client never opened a unidirectional stream")
            .unwrap();
        let stream_type = varint::read(&mut recv).await.unwrap();
        assert_eq!(stream_type, 0x00, "expected a control stream");
        match frame::read_frame(&mut recv).await.unwrap() {
            Frame::Settings(settings) => settings,
            other => panic!("expected SETTINGS, got {:?}", other),
        }
    }

    /// Wait for the next request stream and read the full request.
    pub async fn accept_request(&self) -> MockRequest {
        let stream = tokio::time::timeout(WAIT, self.conn.accept_bidi_stream())
            .await
            .expect("no request arrived")
            .unwrap();
        let (send, mut recv) = stream.into_parts();

        let mut raw = Vec::new();
        tokio::time::timeout(WAIT, recv.read_to_end(&mut raw))
            .await
            .expect("request stream never finished")
            .unwrap();

        let mut headers = Vec::new();
        let mut body = Vec::new();
        let mut rest = &raw[..];
        while !rest.is_empty() {
            let (frame_type, n) = varint::decode(rest).unwrap();
            rest = &rest[n..];
            let (length, n) = varint::decode(rest).unwrap();
            rest = &rest[n..];
            let (payload, tail) = rest.split_at(length as usize);
            rest = tail;
            match FrameType::from(frame_type) {
                FrameType::Headers => {
                    headers = Decoder::new()
                        .decode_full(payload)
                        .unwrap()
                        .into_iter()
                        .map(|f| {
                            (
                                String::from_utf8(f.name.to_vec()).unwrap(),
                                String::from_utf8(f.value.to_vec()).unwrap(),
                            )
                        })
                        .collect();
                }
                FrameType::Data => body.extend_from_slice(payload),
                other => panic!("unexpected {:?} frame in request", other),
            }
        }

        MockRequest {
            send,
            headers,
            body,
        }
    }

    /// How the connection ended, as seen by the peer.
    pub async fn closed(&self) -> CloseReason {
        tokio::time::timeout(WAIT, self.conn.closed())
            .await
            .expect("connection was not closed")
    }
}

/// Encode a HEADERS frame carrying `fields` in order.
#[allow(dead_code)]
pub fn headers_frame(fields: &[(&str, &str)]) -> Bytes {
    let fields: Vec<HeaderField> = fields
        .iter()
        .map(|(n, v)| HeaderField::new(n.to_string(), v.to_string()))
        .collect();
    let block = Encoder::new().encode(&fields);
    let mut buf = BytesMut::new();
    frame::encode_frame(&mut buf, FrameType::Headers, &block);
    buf.freeze()
}

#[allow(dead_code)]
pub fn data_frame(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    frame::encode_frame(&mut buf, FrameType::Data, data);
    buf.freeze()
}

/// A request as received by the peer, with the stream to answer on.
pub struct MockRequest {
    pub send: SendStream,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[allow(dead_code)]
impl MockRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    pub fn send_headers(&mut self, status: &str, headers: &[(&str, &str)]) {
        let mut fields = vec![(":status", status)];
        fields.extend_from_slice(headers);
        self.send.write(headers_frame(&fields)).unwrap();
    }

    pub fn send_data(&mut self, data: &[u8]) {
        self.send.write(data_frame(data)).unwrap();
    }

    pub fn write_raw(&mut self, bytes: impl Into<Bytes>) {
        self.send.write(bytes).unwrap();
    }

    pub fn finish(&mut self) {
        self.send.finish().unwrap();
    }

    /// Headers, one DATA frame when `body` is non-empty, then FIN.
    pub fn respond(&mut self, status: &str, headers: &[(&str, &str)], body: &[u8]) {
        self.send_headers(status, headers);
        if !body.is_empty() {
            self.send_data(body);
        }
        self.finish();
    }
}
