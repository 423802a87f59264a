use crate::error::ClientError;
use cm_common::proto::CMsgClientLogonResponse;
use cm_common::{Endpoint, Header};
use tokio::sync::{mpsc, oneshot};

/// Connection status of the CM link, observable through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Not connected to any CM.
    Disconnected,
    /// TCP connection or channel-encrypt exchange in progress.
    Connecting,
    /// Channel encrypted and ready to route messages.
    Ready,
}

/// Snapshot of the logical session state.
///
/// The identity fields are zero until the first populated proto header
/// latches them, and reset when the connection is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionInfo {
    /// 64-bit account identifier.
    pub steam_id: u64,
    /// Session identifier assigned by the CM.
    pub session_id: i32,
    /// Whether a logon has been acknowledged on this connection.
    pub logged_on: bool,
}

/// An outbound message queued for the session task.
#[derive(Debug)]
pub(crate) struct OutboundMsg {
    /// Header to stamp and encode.
    pub header: Header,
    /// Message body, appended after the encoded header.
    pub body: Vec<u8>,
    /// Present when the caller awaits a correlated response.
    pub job: Option<oneshot::Sender<NetMessage>>,
    /// Set only by [`ReplyHandle`]: the peer job id this message answers.
    pub reply_to: Option<u64>,
}

/// A message delivered to the application.
#[derive(Debug)]
pub struct NetMessage {
    /// The decoded header.
    pub header: Header,
    /// The message body following the header.
    pub body: Vec<u8>,
    /// Continuation for answering the peer, present when the frame carried
    /// a source job id.
    pub reply: Option<ReplyHandle>,
}

/// Continuation for answering a peer-initiated job.
///
/// Stamps the peer's source job id as the target job on whichever header
/// variant the caller supplies.
#[derive(Debug, Clone)]
pub struct ReplyHandle {
    pub(crate) target_job: u64,
    pub(crate) outbox: mpsc::Sender<OutboundMsg>,
}

impl ReplyHandle {
    /// The peer job id this handle answers.
    pub fn target_job(&self) -> u64 {
        self.target_job
    }

    /// Sends a response frame.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] when the session is gone.
    pub async fn send(&self, header: Header, body: Vec<u8>) -> Result<(), ClientError> {
        self.outbox
            .send(OutboundMsg {
                header,
                body,
                job: None,
                reply_to: Some(self.target_job),
            })
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Sends a response frame that itself awaits a further response.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] when the session is gone.
    pub async fn send_job(
        &self,
        header: Header,
        body: Vec<u8>,
    ) -> Result<oneshot::Receiver<NetMessage>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.outbox
            .send(OutboundMsg {
                header,
                body,
                job: Some(tx),
                reply_to: Some(self.target_job),
            })
            .await
            .map_err(|_| ClientError::NotConnected)?;
        Ok(rx)
    }
}

/// Action returned by a [`MessageHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Keep the session running.
    Continue,
    /// Tear the session down before any further frame is dispatched,
    /// including the remainder of a multi batch.
    Disconnect,
}

/// Synchronous observer invoked on the session task for every message
/// delivered to the application, before the matching job callback or
/// [`ClientEvent::Message`] is queued.
///
/// The hook runs to completion without interleaving with other session
/// work, so returning [`HookAction::Disconnect`] after one sub-message of
/// a batch is observed before the next one is dispatched. Consumers of the
/// event channel can call
/// [`CmClient::disconnect`](crate::CmClient::disconnect) instead, but that
/// signal crosses tasks: frames already buffered, including the rest of a
/// batch, may dispatch before it is observed.
pub type MessageHook = Box<dyn FnMut(&NetMessage) -> HookAction + Send + Sync>;

/// Events delivered to the application over the client's event channel.
#[derive(Debug)]
pub enum ClientEvent {
    /// The channel-encrypt exchange completed; the link is ready.
    Connected,
    /// A message with no matching job callback.
    Message(NetMessage),
    /// The CM pushed a refreshed server list.
    Servers(Vec<Endpoint>),
    /// Outcome of a logon attempt, successful or not.
    LogOnResponse(CMsgClientLogonResponse),
    /// The CM logged the session off.
    LoggedOff {
        /// Reason code.
        eresult: i32,
    },
    /// A terminal client error; no further events follow.
    Error(ClientError),
}
