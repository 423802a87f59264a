//! Wire-level types shared across the CM protocol stack.
//!
//! This crate provides:
//! - Message-type enumeration and result codes ([`emsg`])
//! - The three wire header variants and their codec ([`header`])
//! - Channel-encrypt handshake message bodies ([`handshake`])
//! - Generated protobuf schema types ([`proto`])
//! - Session-key generation and the packet cipher ([`crypto`])
//! - Multi-payload decompression ([`compress`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod compress;
pub mod crypto;
pub mod emsg;
pub mod handshake;
pub mod header;
pub mod proto;
pub mod types;

pub use emsg::EMsg;
pub use header::Header;
pub use types::Endpoint;
