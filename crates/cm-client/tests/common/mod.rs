//! Scripted mock CM for driving the client over the real wire protocol.

use cm_client::{ClientConfig, ClientEvent};
use cm_common::crypto::{key_checksum, ChannelCipher, SESSION_KEY_LEN};
use cm_common::emsg::eresult;
use cm_common::handshake::{ChannelEncryptRequest, ChannelEncryptResponse, ChannelEncryptResult};
use cm_common::{EMsg, Endpoint, Header};
use rand::rngs::OsRng;
use rsa::{Oaep, RsaPrivateKey};
use sha1::Sha1;
use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared RSA keypair standing in for the CM fleet key. Generated once; the
/// client under test is configured with the public half.
pub fn test_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 1024).expect("test key generation"))
}

pub struct MockCm {
    listener: TcpListener,
    pub addr: SocketAddr,
}

impl MockCm {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    pub async fn start_at(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        Self { listener, addr }
    }

    /// A client configuration pointing at this mock, with retry disabled.
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            server: Some(Endpoint::new("127.0.0.1", self.addr.port())),
            auto_retry: false,
            channel_key: test_key().to_public_key(),
            ..Default::default()
        }
    }

    pub async fn accept(&self) -> MockConn {
        let (stream, _) = self.listener.accept().await.unwrap();
        stream.set_nodelay(true).unwrap();
        MockConn {
            stream,
            cipher: None,
        }
    }
}

pub struct MockConn {
    stream: TcpStream,
    cipher: Option<ChannelCipher>,
}

impl MockConn {
    pub async fn send(&mut self, header: Header, body: &[u8]) {
        let mut frame = header.encode();
        frame.extend_from_slice(body);
        let payload = match &self.cipher {
            Some(cipher) => cipher.encrypt(&frame),
            None => frame,
        };
        cm_client::transport::write_frame(&mut self.stream, &payload)
            .await
            .unwrap();
    }

    pub async fn recv(&mut self) -> (Header, Vec<u8>) {
        self.recv_timeout(RECV_TIMEOUT)
            .await
            .expect("timeout waiting for frame from client")
    }

    pub async fn recv_timeout(&mut self, limit: Duration) -> Option<(Header, Vec<u8>)> {
        let payload = timeout(limit, cm_client::transport::read_frame(&mut self.stream))
            .await
            .ok()?
            .ok()?;
        let plain = match &self.cipher {
            Some(cipher) => cipher.decrypt(&payload).unwrap(),
            None => payload,
        };
        let (header, offset) = Header::decode(&plain).unwrap();
        Some((header, plain[offset..].to_vec()))
    }

    /// Drives the CM side of a successful channel-encrypt exchange and
    /// installs the negotiated cipher.
    pub async fn handshake(&mut self) {
        let wrapped = self.encrypt_exchange().await;
        let plain = test_key()
            .decrypt(Oaep::new::<Sha1>(), &wrapped)
            .expect("session key unwrap");
        let key: [u8; SESSION_KEY_LEN] = plain.try_into().expect("session key length");

        self.send(
            Header::plain(EMsg::ChannelEncryptResult),
            &ChannelEncryptResult {
                result: eresult::OK,
            }
            .encode(),
        )
        .await;
        self.cipher = Some(ChannelCipher::new(key));
    }

    /// Drives the exchange but reports `result`, leaving the channel plain.
    pub async fn reject_handshake(&mut self, result: i32) {
        self.encrypt_exchange().await;
        self.send(
            Header::plain(EMsg::ChannelEncryptResult),
            &ChannelEncryptResult { result }.encode(),
        )
        .await;
    }

    /// Sends the encrypt request and validates the client's response body:
    /// `prefix ‖ wrapped_key ‖ crc32 ‖ u32(0)`. Returns the wrapped key.
    async fn encrypt_exchange(&mut self) -> Vec<u8> {
        self.send(
            Header::plain(EMsg::ChannelEncryptRequest),
            &ChannelEncryptRequest {
                protocol_version: 1,
                universe: 1,
            }
            .encode(),
        )
        .await;

        let (header, body) = self.recv().await;
        assert_eq!(header.msg(), EMsg::ChannelEncryptResponse);
        assert!(matches!(header, Header::Plain { .. }));

        let prefix = ChannelEncryptResponse::decode(&body).unwrap();
        assert_eq!(prefix.key_size, 128);
        assert_eq!(body.len(), 8 + 128 + 4 + 4);

        let wrapped = body[8..136].to_vec();
        let crc = u32::from_le_bytes(body[136..140].try_into().unwrap());
        assert_eq!(crc, key_checksum(&wrapped), "key checksum mismatch");
        assert_eq!(&body[140..144], &[0u8; 4], "reserved trailer");
        wrapped
    }
}

/// Encodes one sub-frame for a multi payload.
pub fn sub_frame(header: Header, body: &[u8]) -> Vec<u8> {
    let mut frame = header.encode();
    frame.extend_from_slice(body);
    frame
}

/// Concatenates sub-frames with their little-endian length prefixes.
pub fn multi_body(frames: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(frame);
    }
    out
}

/// Packs a multi body into the on-wire zip container.
pub fn zip_multi(payload: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    writer.start_file("z", options).unwrap();
    writer.write_all(payload).unwrap();
    writer.finish().unwrap().into_inner()
}

pub async fn next_event(events: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    timeout(RECV_TIMEOUT, events.recv())
        .await
        .expect("timeout waiting for client event")
        .expect("event channel closed")
}
