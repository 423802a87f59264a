//! The CM session client.
//!
//! A [`CmClient`] owns a background task that drives one connection at a
//! time: TCP connect, the channel-encrypt exchange, then a select loop over
//! inbound frames, the outbox, the heartbeat, and shutdown. All session
//! state lives inside that task, so dispatch, job resolution, and timer
//! handling are serialized by construction.

use crate::backoff::ExponentialBackoff;
use crate::config::ClientConfig;
use crate::directory::ServerDirectory;
use crate::error::ClientError;
use crate::event::{
    ClientEvent, ConnStatus, HookAction, MessageHook, NetMessage, OutboundMsg, ReplyHandle,
    SessionInfo,
};
use crate::jobs::JobRegistry;
use crate::transport::{self, FrameError};
use cm_common::compress::unpack_multi;
use cm_common::crypto::{self, ChannelCipher, SessionKey};
use cm_common::emsg::eresult;
use cm_common::handshake::{ChannelEncryptRequest, ChannelEncryptResponse, ChannelEncryptResult};
use cm_common::proto::{
    CMsgClientCmList, CMsgClientHeartBeat, CMsgClientLoggedOff, CMsgClientLogonResponse, CMsgMulti,
};
use cm_common::header::HeaderError;
use cm_common::types::JOBID_NONE;
use cm_common::{EMsg, Endpoint, Header};
use prost::Message;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const OUTBOX_DEPTH: usize = 64;
const EVENT_DEPTH: usize = 64;

/// Handle to a CM session.
///
/// Cheap to clone channel-wise but intentionally single-owner: dropping the
/// handle shuts the session down.
#[derive(Debug)]
pub struct CmClient {
    outbox: mpsc::Sender<OutboundMsg>,
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<ConnStatus>,
    session: watch::Receiver<SessionInfo>,
}

impl CmClient {
    /// Starts a client and returns the handle plus its event stream.
    ///
    /// The connection is established in the background; watch
    /// [`status`](Self::status) or wait for [`ClientEvent::Connected`].
    pub fn connect(
        config: ClientConfig,
        directory: Arc<ServerDirectory>,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        Self::start(config, directory, None)
    }

    /// Starts a client with a synchronous [`MessageHook`] installed.
    ///
    /// The hook runs on the session task for every delivered message and
    /// can tear the session down mid-batch; see [`MessageHook`].
    pub fn connect_with_hook(
        config: ClientConfig,
        directory: Arc<ServerDirectory>,
        hook: MessageHook,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        Self::start(config, directory, Some(hook))
    }

    fn start(
        config: ClientConfig,
        directory: Arc<ServerDirectory>,
        hook: Option<MessageHook>,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_DEPTH);
        let (events_tx, events_rx) = mpsc::channel(EVENT_DEPTH);
        let (status_tx, status_rx) = watch::channel(ConnStatus::Disconnected);
        let (session_tx, session_rx) = watch::channel(SessionInfo::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(session_manager(
            config,
            directory,
            hook,
            outbox_rx,
            outbox_tx.clone(),
            events_tx,
            status_tx,
            session_tx,
            shutdown_rx,
        ));

        (
            Self {
                outbox: outbox_tx,
                shutdown: shutdown_tx,
                status: status_rx,
                session: session_rx,
            },
            events_rx,
        )
    }

    /// Returns a receiver observing the connection status.
    pub fn status(&self) -> watch::Receiver<ConnStatus> {
        self.status.clone()
    }

    /// Returns a snapshot of the logical session state.
    pub fn session(&self) -> SessionInfo {
        *self.session.borrow()
    }

    /// Sends a message with no response correlation.
    ///
    /// Any caller-supplied target job id is stripped; this entrypoint
    /// originates requests only. Responses go through
    /// [`ReplyHandle`](crate::ReplyHandle).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] when the session task is gone.
    pub async fn send(&self, header: Header, body: Vec<u8>) -> Result<(), ClientError> {
        self.outbox
            .send(OutboundMsg {
                header,
                body,
                job: None,
                reply_to: None,
            })
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Sends a message and returns a receiver for the correlated response.
    ///
    /// The receiver resolves when the CM answers with the allocated job id
    /// as its target. It fails with a recv error if the connection drops
    /// before the answer arrives.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] when the session task is gone.
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
                reply_to: None,
            })
            .await
            .map_err(|_| ClientError::NotConnected)?;
        Ok(rx)
    }

    /// Tears down the session: cancels any scheduled reconnect, destroys
    /// the transport, stops the heartbeat, and drops pending jobs without
    /// invoking them. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for CmClient {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// How a connection ended, driving the reconnect policy.
enum SessionEnd {
    /// `disconnect()` was observed.
    Shutdown,
    /// Terminal failure; surfaced to the application, never retried.
    Fatal(ClientError),
    /// The transport closed.
    Closed {
        /// Whether the channel had been encrypted during this attempt.
        reached_ready: bool,
        /// Whether the close followed an error.
        had_error: bool,
    },
}

type HandleResult = Result<(), SessionEnd>;

fn fatal(err: impl Into<ClientError>) -> SessionEnd {
    SessionEnd::Fatal(err.into())
}

async fn emit(events: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    if events.send(event).await.is_err() {
        debug!("event dropped: no active subscriber");
    }
}

#[allow(clippy::too_many_arguments)]
async fn session_manager(
    config: ClientConfig,
    directory: Arc<ServerDirectory>,
    mut hook: Option<MessageHook>,
    mut outbox_rx: mpsc::Receiver<OutboundMsg>,
    outbox_tx: mpsc::Sender<OutboundMsg>,
    events_tx: mpsc::Sender<ClientEvent>,
    status_tx: watch::Sender<ConnStatus>,
    session_tx: watch::Sender<SessionInfo>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = ExponentialBackoff::new(Duration::from_secs(1));
    let mut last_server: Option<Endpoint> = None;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Retries go back to the server of the previous attempt; a fresh
        // pick happens only on the first attempt of a client's lifetime.
        let picked = config
            .server
            .clone()
            .or_else(|| last_server.clone())
            .or_else(|| directory.pick());
        let Some(server) = picked else {
            warn!("no CM endpoints available");
            emit(&events_tx, ClientEvent::Error(ClientError::CannotConnect)).await;
            break;
        };
        last_server = Some(server.clone());

        status_tx.send_replace(ConnStatus::Connecting);
        debug!(server = %server, "connecting to CM");

        let end = run_connection(
            &config,
            &server,
            &directory,
            hook.as_mut(),
            &mut backoff,
            &mut outbox_rx,
            &outbox_tx,
            &events_tx,
            &status_tx,
            &session_tx,
            &mut shutdown_rx,
        )
        .await;
        status_tx.send_replace(ConnStatus::Disconnected);
        session_tx.send_replace(SessionInfo::default());

        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Fatal(err) => {
                emit(&events_tx, ClientEvent::Error(err)).await;
                break;
            }
            SessionEnd::Closed {
                reached_ready: true,
                ..
            } => {
                // An encrypted session never reconnects on its own.
                emit(&events_tx, ClientEvent::Error(ClientError::Disconnected)).await;
                break;
            }
            SessionEnd::Closed { had_error, .. } => {
                if !config.auto_retry {
                    emit(&events_tx, ClientEvent::Error(ClientError::CannotConnect)).await;
                    break;
                }
                if had_error {
                    let delay = backoff.next_delay();
                    debug!(delay_secs = delay.as_secs(), server = %server, "scheduling reconnect");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                // A clean close during the handshake retries immediately
                // with the backoff unchanged.
            }
        }
    }

    status_tx.send_replace(ConnStatus::Disconnected);
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    config: &ClientConfig,
    server: &Endpoint,
    directory: &ServerDirectory,
    hook: Option<&mut MessageHook>,
    backoff: &mut ExponentialBackoff,
    outbox_rx: &mut mpsc::Receiver<OutboundMsg>,
    outbox_tx: &mpsc::Sender<OutboundMsg>,
    events_tx: &mpsc::Sender<ClientEvent>,
    status_tx: &watch::Sender<ConnStatus>,
    session_tx: &watch::Sender<SessionInfo>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let stream = match transport::connect(
        server,
        config.local_addr,
        config.local_port,
        config.connect_timeout,
    )
    .await
    {
        Ok(stream) => stream,
        Err(err) => {
            debug!(server = %server, error = %err, "connect failed");
            return SessionEnd::Closed {
                reached_ready: false,
                had_error: true,
            };
        }
    };

    // A successful TCP connect is enough to clear accumulated backoff.
    backoff.reset();

    let (reader, writer) = stream.into_split();
    let mut frames = transport::spawn_reader(reader);

    let mut session = Session {
        config,
        directory,
        hook,
        writer,
        cipher: None,
        pending_key: None,
        connected: false,
        closing: false,
        logged_on: false,
        session_id: 0,
        steam_id: 0,
        jobs: JobRegistry::new(),
        heartbeat_period: None,
        next_heartbeat: None,
        idle_timeout: Some(config.connect_timeout),
        outbox_tx: outbox_tx.clone(),
        events: events_tx.clone(),
        status: status_tx,
        session_watch: session_tx,
        shutdown: shutdown_rx.clone(),
    };

    let end = loop {
        if session.closing {
            break SessionEnd::Shutdown;
        }
        let heartbeat_at = session
            .next_heartbeat
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86400 * 365 * 30));

        let step = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { Err(SessionEnd::Shutdown) } else { Ok(()) }
            }
            outcome = next_frame(&mut frames, session.idle_timeout) => match outcome {
                ReadOutcome::Frame(payload) => session.handle_frame(&payload).await,
                ReadOutcome::ClosedClean => Err(SessionEnd::Closed {
                    reached_ready: session.connected,
                    had_error: false,
                }),
                ReadOutcome::ClosedError(err) => {
                    debug!(error = %err, "transport error");
                    Err(SessionEnd::Closed {
                        reached_ready: session.connected,
                        had_error: true,
                    })
                }
                ReadOutcome::IdleTimeout => {
                    debug!("read timed out");
                    Err(SessionEnd::Closed {
                        reached_ready: session.connected,
                        had_error: true,
                    })
                }
            },
            outbound = outbox_rx.recv(), if session.connected => match outbound {
                Some(out) => session.send_outbound(out).await,
                None => Err(SessionEnd::Shutdown),
            },
            () = tokio::time::sleep_until(heartbeat_at) => session.send_heartbeat().await,
        };

        if let Err(end) = step {
            break end;
        }
    };

    // Pending jobs are dropped, not invoked; their receivers observe the
    // drop as a recv error.
    session.jobs.clear();
    end
}

enum ReadOutcome {
    Frame(Vec<u8>),
    ClosedClean,
    ClosedError(FrameError),
    IdleTimeout,
}

async fn next_frame(
    frames: &mut mpsc::Receiver<Result<Vec<u8>, FrameError>>,
    idle: Option<Duration>,
) -> ReadOutcome {
    let item = match idle {
        Some(limit) => match tokio::time::timeout(limit, frames.recv()).await {
            Ok(item) => item,
            Err(_) => return ReadOutcome::IdleTimeout,
        },
        None => frames.recv().await,
    };
    match item {
        Some(Ok(payload)) => ReadOutcome::Frame(payload),
        Some(Err(err)) => ReadOutcome::ClosedError(err),
        None => ReadOutcome::ClosedClean,
    }
}

struct Session<'a> {
    config: &'a ClientConfig,
    directory: &'a ServerDirectory,
    hook: Option<&'a mut MessageHook>,
    writer: OwnedWriteHalf,
    cipher: Option<ChannelCipher>,
    pending_key: Option<SessionKey>,
    connected: bool,
    /// Set when a hook requests disconnect; checked between dispatches.
    closing: bool,
    logged_on: bool,
    session_id: i32,
    steam_id: u64,
    jobs: JobRegistry,
    heartbeat_period: Option<Duration>,
    next_heartbeat: Option<Instant>,
    idle_timeout: Option<Duration>,
    outbox_tx: mpsc::Sender<OutboundMsg>,
    events: mpsc::Sender<ClientEvent>,
    status: &'a watch::Sender<ConnStatus>,
    session_watch: &'a watch::Sender<SessionInfo>,
    shutdown: watch::Receiver<bool>,
}

impl Session<'_> {
    async fn emit(&self, event: ClientEvent) {
        emit(&self.events, event).await;
    }

    fn shutting_down(&self) -> bool {
        self.closing || *self.shutdown.borrow()
    }

    fn run_hook(&mut self, msg: &NetMessage) -> HookAction {
        match &mut self.hook {
            Some(hook) => hook(msg),
            None => HookAction::Continue,
        }
    }

    fn publish_session(&self) {
        self.session_watch.send_replace(SessionInfo {
            steam_id: self.steam_id,
            session_id: self.session_id,
            logged_on: self.logged_on,
        });
    }

    /// Decrypts one transport payload and feeds it to the dispatcher.
    async fn handle_frame(&mut self, payload: &[u8]) -> HandleResult {
        match &self.cipher {
            Some(cipher) => {
                let plain = cipher.decrypt(payload).map_err(fatal)?;
                self.dispatch(&plain).await
            }
            None => self.dispatch(payload).await,
        }
    }

    /// Routes one plaintext frame: header decode, session latch, internal
    /// handler, then job resolution or the generic message event.
    fn dispatch<'a>(&'a mut self, frame: &'a [u8]) -> Pin<Box<dyn Future<Output = HandleResult> + Send + 'a>> {
        Box::pin(async move { self.dispatch_inner(frame).await })
    }

    async fn dispatch_inner(&mut self, frame: &[u8]) -> HandleResult {
        let (header, body_start) = Header::decode(frame).map_err(fatal)?;
        let body = &frame[body_start..];

        // The first populated proto header delivers the session identity;
        // it is latched for the lifetime of the connection.
        if let Header::Proto { proto, .. } = &header {
            let session_id = proto.client_sessionid.unwrap_or_default();
            if self.session_id == 0 && session_id != 0 {
                self.session_id = session_id;
                self.steam_id = proto.steamid.unwrap_or_default();
                debug!(session_id, steam_id = self.steam_id, "session established");
                self.publish_session();
            }
        }

        match header.msg() {
            EMsg::ChannelEncryptRequest => return self.on_encrypt_request(body).await,
            EMsg::ChannelEncryptResult => return self.on_encrypt_result(body).await,
            EMsg::Multi => return self.on_multi(body).await,
            EMsg::ClientLogOnResponse => return self.on_logon_response(body).await,
            EMsg::ClientLoggedOff => return self.on_logged_off(body).await,
            EMsg::ClientCMList => return self.on_cm_list(body).await,
            _ => {}
        }

        let source_job = header.source_job();
        let target_job = header.target_job();
        let reply = (source_job != JOBID_NONE).then(|| ReplyHandle {
            target_job: source_job,
            outbox: self.outbox_tx.clone(),
        });

        let msg = NetMessage {
            header,
            body: body.to_vec(),
            reply,
        };
        // The hook runs on this task, so its verdict is in hand before the
        // next frame of a batch can be touched.
        let action = self.run_hook(&msg);

        if let Some(tx) = self.jobs.take(target_job) {
            if tx.send(msg).is_err() {
                debug!(target_job, "job response dropped: caller gone");
            }
        } else {
            self.emit(ClientEvent::Message(msg)).await;
        }

        if action == HookAction::Disconnect {
            debug!("message hook requested disconnect");
            self.closing = true;
        }
        Ok(())
    }

    async fn on_encrypt_request(&mut self, body: &[u8]) -> HandleResult {
        let request = ChannelEncryptRequest::decode(body).map_err(fatal)?;
        debug!(
            protocol = request.protocol_version,
            universe = request.universe,
            "channel encrypt request"
        );

        // Key generation may outlast the pre-handshake read timeout.
        self.idle_timeout = None;

        let key = crypto::generate_session_key(&self.config.channel_key).map_err(fatal)?;
        let mut response = ChannelEncryptResponse::default().encode();
        response.extend_from_slice(&key.encrypted);
        response.extend_from_slice(&crypto::key_checksum(&key.encrypted).to_le_bytes());
        response.extend_from_slice(&0u32.to_le_bytes());
        self.pending_key = Some(key);

        self.write(Header::plain(EMsg::ChannelEncryptResponse), &response)
            .await
    }

    async fn on_encrypt_result(&mut self, body: &[u8]) -> HandleResult {
        let result = ChannelEncryptResult::decode(body).map_err(fatal)?;
        if result.result != eresult::OK {
            return Err(SessionEnd::Fatal(ClientError::EncryptionFailed {
                result: result.result,
            }));
        }
        let Some(key) = self.pending_key.take() else {
            warn!("encrypt result without a pending key");
            return Ok(());
        };
        self.cipher = Some(ChannelCipher::new(key.plain));
        self.connected = true;
        self.status.send_replace(ConnStatus::Ready);
        info!("channel encrypted");
        self.emit(ClientEvent::Connected).await;
        Ok(())
    }

    async fn on_multi(&mut self, body: &[u8]) -> HandleResult {
        let multi = CMsgMulti::decode(body).map_err(fatal)?;
        let payload = multi.message_body.unwrap_or_default();
        let payload = if multi.size_unzipped.unwrap_or_default() > 0 {
            unpack_multi(&payload).map_err(fatal)?
        } else {
            payload
        };

        let mut rest = payload.as_slice();
        // Re-checked between sub-frames: a hook that requests disconnect
        // during one sub-message aborts the rest of the batch. The shutdown
        // watch is consulted too, but a disconnect() from another task is
        // best effort against already-buffered frames.
        while !rest.is_empty() && !self.shutting_down() {
            let Some((len_bytes, tail)) = rest.split_first_chunk::<4>() else {
                return Err(fatal(HeaderError::TooShort {
                    expected: 4,
                    actual: rest.len(),
                }));
            };
            let sub_len = u32::from_le_bytes(*len_bytes) as usize;
            let Some(chunk) = tail.get(..sub_len) else {
                return Err(fatal(HeaderError::TooShort {
                    expected: sub_len,
                    actual: tail.len(),
                }));
            };
            let nested = self.dispatch(chunk);
            nested.await?;
            rest = &tail[sub_len..];
        }
        Ok(())
    }

    async fn on_logon_response(&mut self, body: &[u8]) -> HandleResult {
        let response = CMsgClientLogonResponse::decode(body).map_err(fatal)?;
        let result = response.eresult.unwrap_or(eresult::FAIL);
        if result == eresult::OK {
            let seconds = response.out_of_game_heartbeat_seconds.unwrap_or_default();
            if seconds > 0 {
                let period = Duration::from_secs(seconds as u64);
                self.heartbeat_period = Some(period);
                self.next_heartbeat = Some(Instant::now() + period);
            }
            self.logged_on = true;
            self.publish_session();
            info!(heartbeat_secs = response.out_of_game_heartbeat_seconds, "logged on");
        }
        self.emit(ClientEvent::LogOnResponse(response)).await;
        Ok(())
    }

    async fn on_logged_off(&mut self, body: &[u8]) -> HandleResult {
        let message = CMsgClientLoggedOff::decode(body).map_err(fatal)?;
        let reason = message.eresult.unwrap_or(eresult::FAIL);
        self.logged_on = false;
        self.heartbeat_period = None;
        self.next_heartbeat = None;
        self.publish_session();
        debug!(eresult = reason, "logged off by the CM");
        self.emit(ClientEvent::LoggedOff { eresult: reason }).await;
        Ok(())
    }

    async fn on_cm_list(&mut self, body: &[u8]) -> HandleResult {
        let list = CMsgClientCmList::decode(body).map_err(fatal)?;
        let servers: Vec<Endpoint> = list
            .cm_addresses
            .iter()
            .zip(&list.cm_ports)
            .map(|(&address, &port)| {
                Endpoint::new(Ipv4Addr::from(address).to_string(), port as u16)
            })
            .collect();
        debug!(count = servers.len(), "received CM list");
        self.directory.update(servers.clone());
        self.emit(ClientEvent::Servers(servers)).await;
        Ok(())
    }

    /// Stamps and writes one application message from the outbox.
    async fn send_outbound(&mut self, mut out: OutboundMsg) -> HandleResult {
        let source = match out.job.take() {
            Some(tx) => self.jobs.alloc(tx),
            None => JOBID_NONE,
        };
        out.header.set_source_job(source);
        out.header.set_target_job(out.reply_to.unwrap_or(JOBID_NONE));
        out.header.set_session(self.session_id, self.steam_id);
        self.write(out.header, &out.body).await
    }

    async fn send_heartbeat(&mut self) -> HandleResult {
        let body = CMsgClientHeartBeat::default().encode_to_vec();
        let out = OutboundMsg {
            header: Header::proto(EMsg::ClientHeartBeat),
            body,
            job: None,
            reply_to: None,
        };
        self.send_outbound(out).await?;
        if let Some(period) = self.heartbeat_period {
            self.next_heartbeat = Some(Instant::now() + period);
        }
        Ok(())
    }

    /// Encodes, encrypts when the channel is up, and writes one frame.
    async fn write(&mut self, header: Header, body: &[u8]) -> HandleResult {
        let mut frame = header.encode();
        frame.extend_from_slice(body);
        let payload = match &self.cipher {
            Some(cipher) => cipher.encrypt(&frame),
            None => frame,
        };
        transport::write_frame(&mut self.writer, &payload)
            .await
            .map_err(|err| {
                debug!(error = %err, "write failed");
                SessionEnd::Closed {
                    reached_ready: self.connected,
                    had_error: true,
                }
            })
    }
}
