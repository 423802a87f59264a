use crate::transport::FrameError;
use cm_common::compress::CompressError;
use cm_common::crypto::CryptoError;
use cm_common::handshake::HandshakeError;
use cm_common::header::HeaderError;
use thiserror::Error;

/// Errors surfaced by the CM client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket-level failure; the close that follows is authoritative.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Transport framing failure.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    /// The CM rejected the channel-encrypt exchange.
    #[error("encryption failed: {result}")]
    EncryptionFailed {
        /// The `eresult` code the CM reported.
        result: i32,
    },
    /// A previously encrypted session was torn down unexpectedly.
    #[error("disconnected")]
    Disconnected,
    /// The connection attempt failed and automatic retry is disabled.
    #[error("cannot connect")]
    CannotConnect,
    /// A header failed to decode; fatal for the connection.
    #[error("protocol error: {0}")]
    Header(#[from] HeaderError),
    /// A handshake body failed to decode; fatal for the connection.
    #[error("protocol error: {0}")]
    Handshake(#[from] HandshakeError),
    /// Channel crypto failure on an inbound payload.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    /// A multi payload could not be unpacked.
    #[error("decompress error: {0}")]
    Compress(#[from] CompressError),
    /// The client is not connected; the session task is gone.
    #[error("not connected")]
    NotConnected,
    /// A protobuf message failed to decode; fatal for the connection.
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}
