//! Client for the CM session protocol.
//!
//! Maintains a long-lived framed TCP session to a CM node: connects,
//! negotiates channel encryption, multiplexes typed request/response
//! messages, expands batched frames, keeps the link alive with heartbeats,
//! and reconnects with exponential backoff.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Exponential backoff for reconnection.
pub mod backoff;
/// The session client: connection manager, dispatcher, heartbeat.
pub mod client;
/// Client configuration.
pub mod config;
/// Shared CM server directory.
pub mod directory;
/// Typed client errors.
pub mod error;
/// Events, delivered messages, and reply continuations.
pub mod event;
mod jobs;
/// Length-prefixed TCP framing.
pub mod transport;

pub use client::CmClient;
pub use config::ClientConfig;
pub use directory::ServerDirectory;
pub use error::ClientError;
pub use event::{ClientEvent, ConnStatus, HookAction, MessageHook, NetMessage, ReplyHandle, SessionInfo};
