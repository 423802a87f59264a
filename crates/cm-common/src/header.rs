//! The three CM wire header variants and their codec.
//!
//! Every frame starts with a little-endian `u32` raw message type. Bit 31
//! set means a protobuf header follows. With bit 31 clear, the two
//! channel-encrypt handshake messages use the compact plain header; every
//! other message uses the extended client header.
//!
//! ```text
//! Plain      u32 emsg | u64 target_job | u64 source_job
//! Proto      u32 emsg|0x80000000 | i32 header_len | protobuf[header_len]
//! Extended   u32 emsg | u8 size | u16 version | u64 target_job |
//!            u64 source_job | u8 canary | u64 steam_id | i32 session_id
//! ```

use crate::emsg::EMsg;
use crate::proto::CMsgProtoBufHeader;
use crate::types::{JOBID_NONE, PROTO_MASK};
use prost::Message;
use thiserror::Error;

/// Fixed byte length of the plain header.
pub const PLAIN_HEADER_LEN: usize = 20;
/// Fixed byte length of the extended header.
pub const EXTENDED_HEADER_LEN: usize = 36;
/// `header_version` field of the extended header.
pub const EXTENDED_HEADER_VERSION: u16 = 2;
/// `header_canary` field of the extended header.
pub const EXTENDED_HEADER_CANARY: u8 = 239;

/// Errors that can occur while decoding a header.
#[derive(Debug, Error)]
pub enum HeaderError {
    /// The frame is too short for the selected header variant.
    #[error("header too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected byte count.
        expected: usize,
        /// Actual byte count received.
        actual: usize,
    },
    /// The extended header canary byte did not match.
    #[error("bad header canary: 0x{0:02x}")]
    BadCanary(u8),
    /// The proto header declared a negative length.
    #[error("negative proto header length: {0}")]
    NegativeHeaderLength(i32),
    /// The embedded protobuf header failed to decode.
    #[error("proto header: {0}")]
    Proto(#[from] prost::DecodeError),
}

/// A decoded message header, normalized from its wire variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Header {
    /// Compact header used by the channel-encrypt handshake.
    Plain {
        /// Message type.
        msg: EMsg,
        /// Job this message answers, or [`JOBID_NONE`].
        target_job: u64,
        /// Job chosen by the sender, or [`JOBID_NONE`].
        source_job: u64,
    },
    /// Protobuf header used by all modern messages.
    Proto {
        /// Message type.
        msg: EMsg,
        /// The embedded protobuf header.
        proto: CMsgProtoBufHeader,
    },
    /// Extended header used by non-proto logged-in messages.
    Extended {
        /// Message type.
        msg: EMsg,
        /// Job this message answers, or [`JOBID_NONE`].
        target_job: u64,
        /// Job chosen by the sender, or [`JOBID_NONE`].
        source_job: u64,
        /// 64-bit account identifier.
        steam_id: u64,
        /// Session identifier assigned by the CM.
        session_id: i32,
    },
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

impl Header {
    /// Creates a plain header with no job correlation.
    pub fn plain(msg: EMsg) -> Self {
        Self::Plain {
            msg,
            target_job: JOBID_NONE,
            source_job: JOBID_NONE,
        }
    }

    /// Creates a proto header with default protobuf fields.
    pub fn proto(msg: EMsg) -> Self {
        Self::Proto {
            msg,
            proto: CMsgProtoBufHeader::default(),
        }
    }

    /// Creates an extended header with no job correlation and zero session.
    pub fn extended(msg: EMsg) -> Self {
        Self::Extended {
            msg,
            target_job: JOBID_NONE,
            source_job: JOBID_NONE,
            steam_id: 0,
            session_id: 0,
        }
    }

    /// Returns the message type.
    pub fn msg(&self) -> EMsg {
        match self {
            Self::Plain { msg, .. } | Self::Proto { msg, .. } | Self::Extended { msg, .. } => *msg,
        }
    }

    /// Reads the raw message type of a frame without decoding the header.
    ///
    /// Returns the message type and whether the proto flag is set.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::TooShort`] if the frame holds less than four
    /// bytes.
    pub fn peek(bytes: &[u8]) -> Result<(EMsg, bool), HeaderError> {
        if bytes.len() < 4 {
            return Err(HeaderError::TooShort {
                expected: 4,
                actual: bytes.len(),
            });
        }
        let raw = read_u32(bytes, 0);
        Ok((EMsg::from_raw(raw), raw & PROTO_MASK != 0))
    }

    /// Decodes the header of a frame, selecting the variant from the wire.
    ///
    /// Returns the header and the offset at which the message body starts.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError`] if the frame is truncated, the extended
    /// canary does not match, or the embedded protobuf fails to decode.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), HeaderError> {
        let (msg, is_proto) = Self::peek(bytes)?;

        if is_proto {
            if bytes.len() < 8 {
                return Err(HeaderError::TooShort {
                    expected: 8,
                    actual: bytes.len(),
                });
            }
            let declared = read_u32(bytes, 4) as i32;
            if declared < 0 {
                return Err(HeaderError::NegativeHeaderLength(declared));
            }
            let header_len = declared as usize;
            let end = 8 + header_len;
            if bytes.len() < end {
                return Err(HeaderError::TooShort {
                    expected: end,
                    actual: bytes.len(),
                });
            }
            let proto = CMsgProtoBufHeader::decode(&bytes[8..end])?;
            return Ok((Self::Proto { msg, proto }, end));
        }

        if msg.is_handshake() {
            if bytes.len() < PLAIN_HEADER_LEN {
                return Err(HeaderError::TooShort {
                    expected: PLAIN_HEADER_LEN,
                    actual: bytes.len(),
                });
            }
            return Ok((
                Self::Plain {
                    msg,
                    target_job: read_u64(bytes, 4),
                    source_job: read_u64(bytes, 12),
                },
                PLAIN_HEADER_LEN,
            ));
        }

        if bytes.len() < EXTENDED_HEADER_LEN {
            return Err(HeaderError::TooShort {
                expected: EXTENDED_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let canary = bytes[23];
        if canary != EXTENDED_HEADER_CANARY {
            return Err(HeaderError::BadCanary(canary));
        }
        let mut session = [0u8; 4];
        session.copy_from_slice(&bytes[32..36]);
        Ok((
            Self::Extended {
                msg,
                target_job: read_u64(bytes, 7),
                source_job: read_u64(bytes, 15),
                steam_id: read_u64(bytes, 24),
                session_id: i32::from_le_bytes(session),
            },
            EXTENDED_HEADER_LEN,
        ))
    }

    /// Encodes this header into its wire form.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Plain {
                msg,
                target_job,
                source_job,
            } => {
                let mut out = Vec::with_capacity(PLAIN_HEADER_LEN);
                out.extend_from_slice(&msg.raw().to_le_bytes());
                out.extend_from_slice(&target_job.to_le_bytes());
                out.extend_from_slice(&source_job.to_le_bytes());
                out
            }
            Self::Proto { msg, proto } => {
                let header = proto.encode_to_vec();
                let mut out = Vec::with_capacity(8 + header.len());
                out.extend_from_slice(&(msg.raw() | PROTO_MASK).to_le_bytes());
                out.extend_from_slice(&(header.len() as i32).to_le_bytes());
                out.extend_from_slice(&header);
                out
            }
            Self::Extended {
                msg,
                target_job,
                source_job,
                steam_id,
                session_id,
            } => {
                let mut out = Vec::with_capacity(EXTENDED_HEADER_LEN);
                out.extend_from_slice(&msg.raw().to_le_bytes());
                out.push(EXTENDED_HEADER_LEN as u8);
                out.extend_from_slice(&EXTENDED_HEADER_VERSION.to_le_bytes());
                out.extend_from_slice(&target_job.to_le_bytes());
                out.extend_from_slice(&source_job.to_le_bytes());
                out.push(EXTENDED_HEADER_CANARY);
                out.extend_from_slice(&steam_id.to_le_bytes());
                out.extend_from_slice(&session_id.to_le_bytes());
                out
            }
        }
    }

    /// Returns the source job id, [`JOBID_NONE`] when absent.
    pub fn source_job(&self) -> u64 {
        match self {
            Self::Plain { source_job, .. } | Self::Extended { source_job, .. } => *source_job,
            Self::Proto { proto, .. } => proto.jobid_source.unwrap_or(JOBID_NONE),
        }
    }

    /// Returns the target job id, [`JOBID_NONE`] when absent.
    pub fn target_job(&self) -> u64 {
        match self {
            Self::Plain { target_job, .. } | Self::Extended { target_job, .. } => *target_job,
            Self::Proto { proto, .. } => proto.jobid_target.unwrap_or(JOBID_NONE),
        }
    }

    /// Stamps the source job id on whichever variant this is.
    pub fn set_source_job(&mut self, id: u64) {
        match self {
            Self::Plain { source_job, .. } | Self::Extended { source_job, .. } => *source_job = id,
            Self::Proto { proto, .. } => proto.jobid_source = Some(id),
        }
    }

    /// Stamps the target job id on whichever variant this is.
    pub fn set_target_job(&mut self, id: u64) {
        match self {
            Self::Plain { target_job, .. } | Self::Extended { target_job, .. } => *target_job = id,
            Self::Proto { proto, .. } => proto.jobid_target = Some(id),
        }
    }

    /// Stamps the session identity on proto and extended headers.
    pub fn set_session(&mut self, session_id: i32, steam_id: u64) {
        match self {
            Self::Plain { .. } => {}
            Self::Proto { proto, .. } => {
                proto.client_sessionid = Some(session_id);
                proto.steamid = Some(steam_id);
            }
            Self::Extended {
                steam_id: sid,
                session_id: sess,
                ..
            } => {
                *sid = steam_id;
                *sess = session_id;
            }
        }
    }
}
