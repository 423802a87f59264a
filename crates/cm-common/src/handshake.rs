//! Fixed-layout message bodies of the channel-encrypt exchange.
//!
//! The handshake runs before the channel is encrypted, under plain headers:
//! the CM opens with `ChannelEncryptRequest`, the client answers with
//! `ChannelEncryptResponse` carrying the wrapped session key, and the CM
//! closes with `ChannelEncryptResult`. All fields are little-endian.

use thiserror::Error;

/// Protocol version of the channel-encrypt exchange.
pub const ENCRYPT_PROTOCOL_VERSION: u32 = 1;

/// Byte length of the RSA-wrapped session key.
pub const WRAPPED_KEY_LEN: u32 = 128;

/// Errors that can occur while decoding a handshake body.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The body is too short for the message.
    #[error("handshake body too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected byte count.
        expected: usize,
        /// Actual byte count received.
        actual: usize,
    },
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, HandshakeError> {
    let end = at + 4;
    if bytes.len() < end {
        return Err(HandshakeError::TooShort {
            expected: end,
            actual: bytes.len(),
        });
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..end]);
    Ok(u32::from_le_bytes(buf))
}

/// Body of `ChannelEncryptRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEncryptRequest {
    /// Handshake protocol version.
    pub protocol_version: u32,
    /// Universe the CM belongs to.
    pub universe: u32,
}

impl ChannelEncryptRequest {
    /// Decodes the request body.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::TooShort`] on a truncated body.
    pub fn decode(bytes: &[u8]) -> Result<Self, HandshakeError> {
        Ok(Self {
            protocol_version: read_u32(bytes, 0)?,
            universe: read_u32(bytes, 4)?,
        })
    }

    /// Encodes the request body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&self.protocol_version.to_le_bytes());
        out.extend_from_slice(&self.universe.to_le_bytes());
        out
    }
}

/// Body prefix of `ChannelEncryptResponse`; the wrapped key, its checksum,
/// and a reserved trailer follow it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEncryptResponse {
    /// Handshake protocol version.
    pub protocol_version: u32,
    /// Byte length of the wrapped session key that follows.
    pub key_size: u32,
}

impl Default for ChannelEncryptResponse {
    fn default() -> Self {
        Self {
            protocol_version: ENCRYPT_PROTOCOL_VERSION,
            key_size: WRAPPED_KEY_LEN,
        }
    }
}

impl ChannelEncryptResponse {
    /// Decodes the response body prefix.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::TooShort`] on a truncated body.
    pub fn decode(bytes: &[u8]) -> Result<Self, HandshakeError> {
        Ok(Self {
            protocol_version: read_u32(bytes, 0)?,
            key_size: read_u32(bytes, 4)?,
        })
    }

    /// Encodes the response body prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&self.protocol_version.to_le_bytes());
        out.extend_from_slice(&self.key_size.to_le_bytes());
        out
    }
}

/// Body of `ChannelEncryptResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEncryptResult {
    /// Outcome of the exchange, an `eresult` code.
    pub result: i32,
}

impl ChannelEncryptResult {
    /// Decodes the result body.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::TooShort`] on a truncated body.
    pub fn decode(bytes: &[u8]) -> Result<Self, HandshakeError> {
        Ok(Self {
            result: read_u32(bytes, 0)? as i32,
        })
    }

    /// Encodes the result body.
    pub fn encode(&self) -> Vec<u8> {
        (self.result as u32).to_le_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emsg::eresult;

    #[test]
    fn request_round_trip() {
        let req = ChannelEncryptRequest {
            protocol_version: 1,
            universe: 1,
        };
        assert_eq!(ChannelEncryptRequest::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn response_defaults_match_the_wire_contract() {
        let resp = ChannelEncryptResponse::default();
        assert_eq!(resp.protocol_version, 1);
        assert_eq!(resp.key_size, 128);
        let bytes = resp.encode();
        assert_eq!(bytes, [1, 0, 0, 0, 128, 0, 0, 0]);
    }

    #[test]
    fn result_round_trip() {
        let res = ChannelEncryptResult {
            result: eresult::INVALID_PASSWORD,
        };
        assert_eq!(ChannelEncryptResult::decode(&res.encode()).unwrap(), res);
    }

    #[test]
    fn truncated_bodies_are_rejected() {
        assert!(matches!(
            ChannelEncryptRequest::decode(&[1, 0, 0]),
            Err(HandshakeError::TooShort { .. })
        ));
        assert!(matches!(
            ChannelEncryptResult::decode(&[]),
            Err(HandshakeError::TooShort { .. })
        ));
    }
}
