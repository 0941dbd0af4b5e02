//! Connection manager client.
//!
//! Owns one transport, the handshake sequencing, and the session
//! identity; exposes typed send/receive; drives the reconnect policy.
//!
//! Two tasks of control exist per client: the io task spawned by
//! [`CmClient::connect`], which owns the transport and decodes inbound
//! frames in receipt order, and the application's drain loop on the
//! callback dispatcher. Sends funnel through a channel into the io task,
//! which serializes writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::core::envelope::{MessageEnvelope, MsgKind, ResultCode, SessionIdentity};
use crate::directory::ServerDirectory;
use crate::error::{constants, CmError, Result};
use crate::protocol::handshake::{
    respond_to_encrypt_request, EncryptRequest, EncryptResult, KeyStore,
};
use crate::service::callbacks::{
    CallbackDispatcher, CmEvent, ConnectedEvent, DisconnectedEvent,
};
use crate::service::channel::SessionChannel;
use crate::service::jobs::{JobCorrelator, JobFailure, JobHandle, JobStream};
use crate::transport::{self, Endpoint, Transport};
use crate::utils::metrics::{Metrics, MetricsSnapshot};
use crate::utils::timeout::with_timeout;

/// Connection lifecycle; transitions are strictly ordered and owned by
/// the io task. `send` reads it to reject calls in the wrong state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Plaintext,
    Handshaking,
    Encrypted,
}

enum TxCommand {
    Envelope(MessageEnvelope),
    Disconnect,
}

enum SessionEnd {
    HandshakeFailed,
    Ended { user: bool },
}

struct ClientInner {
    config: ClientConfig,
    keys: KeyStore,
    directory: ServerDirectory,
    dispatcher: CallbackDispatcher,
    jobs: JobCorrelator,
    metrics: Metrics,
    state: Mutex<ConnectionState>,
    session: Mutex<Option<SessionIdentity>>,
    tx: Mutex<Option<mpsc::Sender<TxCommand>>>,
    user_disconnect: AtomicBool,
}

/// Client for one CM session.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct CmClient {
    inner: Arc<ClientInner>,
}

impl CmClient {
    pub fn new(config: ClientConfig, directory: ServerDirectory, keys: KeyStore) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                keys,
                directory,
                dispatcher: CallbackDispatcher::new(),
                jobs: JobCorrelator::new(),
                metrics: Metrics::new(),
                state: Mutex::new(ConnectionState::Disconnected),
                session: Mutex::new(None),
                tx: Mutex::new(None),
                user_disconnect: AtomicBool::new(false),
            }),
        }
    }

    /// Client over the bootstrap servers named in the configuration,
    /// with the built-in universe keys.
    ///
    /// # Errors
    /// Returns `CmError::Config` when a bootstrap address does not parse.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let mut endpoints = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            let addr = server
                .parse()
                .map_err(|e| CmError::Config(format!("bad server address '{server}': {e}")))?;
            endpoints.push(Endpoint::stream(addr));
        }
        Ok(Self::new(
            config,
            ServerDirectory::from_static(endpoints),
            KeyStore::builtin(),
        ))
    }

    pub fn dispatcher(&self) -> &CallbackDispatcher {
        &self.inner.dispatcher
    }

    pub fn directory(&self) -> &ServerDirectory {
        &self.inner.directory
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("state lock poisoned")
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn session(&self) -> Option<SessionIdentity> {
        *self.inner.session.lock().expect("session lock poisoned")
    }

    /// Install the identity stamped on outgoing messages. Called by the
    /// embedder's logon handling; cleared automatically at disconnect.
    pub fn set_session(&self, identity: SessionIdentity) {
        *self.inner.session.lock().expect("session lock poisoned") = Some(identity);
    }

    /// Start connecting. Idempotent while a connection attempt or session
    /// is alive; the outcome arrives as a `Connected` event.
    pub fn connect(&self) {
        {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            if *state != ConnectionState::Disconnected {
                debug!(state = ?*state, "connect ignored, already active");
                return;
            }
            *state = ConnectionState::Connecting;
        }
        self.inner.user_disconnect.store(false, Ordering::SeqCst);

        let inner = self.inner.clone();
        tokio::spawn(session_task(inner));
    }

    /// Caller-initiated disconnect. The resulting `Disconnected` event
    /// carries `user_initiated = true`.
    pub async fn disconnect(&self) {
        self.inner.user_disconnect.store(true, Ordering::SeqCst);
        let tx = self
            .inner
            .tx
            .lock()
            .expect("sender lock poisoned")
            .clone();
        if let Some(tx) = tx {
            let _ = tx.send(TxCommand::Disconnect).await;
        }
    }

    /// Disconnect and drop every callback subscription.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.inner.dispatcher.clear_subscriptions();
    }

    /// Send a fire-and-forget message.
    ///
    /// # Errors
    /// `CmError::NotConnected` unless the session is encrypted.
    pub async fn send(&self, mut envelope: MessageEnvelope) -> Result<()> {
        self.ensure_encrypted()?;
        self.stamp(&mut envelope);
        self.enqueue(envelope).await
    }

    /// Send a request expecting exactly one correlated reply.
    ///
    /// # Errors
    /// `CmError::NotConnected` unless the session is encrypted.
    pub async fn send_job(&self, mut envelope: MessageEnvelope) -> Result<JobHandle> {
        self.ensure_encrypted()?;
        let handle = self.inner.jobs.begin();
        let id = handle.id;
        envelope.header.source_job = id.0;
        self.stamp(&mut envelope);

        match self.enqueue(envelope).await {
            Ok(()) => Ok(handle),
            Err(e) => {
                self.inner.jobs.cancel(id);
                Err(e)
            }
        }
    }

    /// Send a request expecting multiple correlated replies, ended by a
    /// job-complete marker.
    ///
    /// # Errors
    /// `CmError::NotConnected` unless the session is encrypted.
    pub async fn send_job_multi(&self, mut envelope: MessageEnvelope) -> Result<JobStream> {
        self.ensure_encrypted()?;
        let stream = self.inner.jobs.begin_multi();
        let id = stream.id;
        envelope.header.source_job = id.0;
        self.stamp(&mut envelope);

        match self.enqueue(envelope).await {
            Ok(()) => Ok(stream),
            Err(e) => {
                self.inner.jobs.cancel(id);
                Err(e)
            }
        }
    }

    /// Send a request and wait for its reply with the configured job
    /// timeout.
    ///
    /// # Errors
    /// `CmError::JobTimeout` when no reply arrives in time; the job is
    /// removed and a late reply dropped.
    pub async fn request(&self, envelope: MessageEnvelope) -> Result<MessageEnvelope> {
        let handle = self.send_job(envelope).await?;
        match handle.wait(self.inner.config.job_timeout).await {
            Err(CmError::JobTimeout) => {
                Metrics::incr(&self.inner.metrics.jobs_timed_out);
                Err(CmError::JobTimeout)
            }
            other => other,
        }
    }

    fn ensure_encrypted(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Encrypted => Ok(()),
            _ => Err(CmError::NotConnected),
        }
    }

    fn stamp(&self, envelope: &mut MessageEnvelope) {
        if let Some(identity) = self.session() {
            envelope.header.identity = identity.raw();
        }
    }

    async fn enqueue(&self, envelope: MessageEnvelope) -> Result<()> {
        let tx = self
            .inner
            .tx
            .lock()
            .expect("sender lock poisoned")
            .clone();
        let Some(tx) = tx else {
            return Err(CmError::NotConnected);
        };
        tx.send(TxCommand::Envelope(envelope))
            .await
            .map_err(|_| CmError::NotConnected)
    }
}

fn set_state(inner: &ClientInner, state: ConnectionState) {
    *inner.state.lock().expect("state lock poisoned") = state;
}

fn post(inner: &ClientInner, event: CmEvent) {
    inner.dispatcher.post_event(event);
    Metrics::incr(&inner.metrics.events_posted);
}

/// Reconnect-policy driver: repeatedly walks the directory's candidates
/// until a session runs, the caller disconnects, or the policy gives up.
async fn session_task(inner: Arc<ClientInner>) {
    let mut failed_passes = 0u32;

    loop {
        if inner.user_disconnect.load(Ordering::SeqCst) {
            break;
        }

        if inner.directory.is_stale(inner.config.server_list_max_age) {
            if let Err(e) = inner.directory.resolve_fallback().await {
                warn!(error = %e, "server discovery failed");
            }
        }

        let candidates = inner.directory.get_servers(None);
        if candidates.is_empty() {
            warn!("no servers known, giving up");
            give_up(&inner);
            return;
        }

        let mut session_ran = false;
        for record in candidates {
            if inner.user_disconnect.load(Ordering::SeqCst) {
                break;
            }

            let endpoint = record.endpoint.clone();
            set_state(&inner, ConnectionState::Connecting);
            info!(%endpoint, "connecting");

            let transport =
                match transport::connect(&endpoint, inner.config.connect_timeout).await {
                    Ok(transport) => transport,
                    Err(e) => {
                        warn!(%endpoint, error = %e, "connect failed");
                        inner.directory.mark_bad(&endpoint);
                        continue;
                    }
                };

            match run_connection(&inner, transport, &endpoint).await {
                SessionEnd::HandshakeFailed => {
                    inner.directory.mark_bad(&endpoint);
                    continue;
                }
                SessionEnd::Ended { user: true } => {
                    return;
                }
                SessionEnd::Ended { user: false } => {
                    session_ran = true;
                    break;
                }
            }
        }

        if inner.user_disconnect.load(Ordering::SeqCst) {
            set_state(&inner, ConnectionState::Disconnected);
            return;
        }

        if session_ran {
            failed_passes = 0;
            if !inner.config.auto_reconnect {
                return;
            }
        } else {
            failed_passes += 1;
            if failed_passes > inner.config.max_reconnect_attempts {
                warn!(passes = failed_passes, "{}", constants::ERR_SERVERS_EXHAUSTED);
                give_up(&inner);
                return;
            }
        }

        // Jitter spreads reconnect storms when many clients lose the
        // same server at once
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        tokio::time::sleep(inner.config.reconnect_delay + jitter).await;
    }

    set_state(&inner, ConnectionState::Disconnected);
}

/// All candidates exhausted: surface a connection-failed event.
fn give_up(inner: &ClientInner) {
    set_state(inner, ConnectionState::Disconnected);
    post(
        inner,
        CmEvent::Connected(ConnectedEvent {
            result: ResultCode::FAIL,
        }),
    );
}

/// Drive one connection: handshake, then the encrypted session loop.
#[instrument(skip(inner, transport), fields(endpoint = %endpoint))]
async fn run_connection(
    inner: &Arc<ClientInner>,
    transport: Box<dyn Transport>,
    endpoint: &Endpoint,
) -> SessionEnd {
    let mut chan = SessionChannel::new(transport);
    set_state(inner, ConnectionState::Plaintext);
    Metrics::incr(&inner.metrics.handshakes_total);

    let handshake = with_timeout(
        drive_handshake(inner, &mut chan),
        inner.config.handshake_timeout,
        CmError::HandshakeTimeout,
    )
    .await;

    if let Err(e) = handshake {
        Metrics::incr(&inner.metrics.handshakes_failed);
        let code = match &e {
            CmError::HandshakeResult(code) => *code,
            CmError::HandshakeTimeout => ResultCode::TIMEOUT,
            _ => ResultCode::FAIL,
        };
        warn!(error = %e, "handshake failed");
        post(inner, CmEvent::Connected(ConnectedEvent { result: code }));
        let _ = chan.shutdown().await;
        set_state(inner, ConnectionState::Disconnected);
        return SessionEnd::HandshakeFailed;
    }

    set_state(inner, ConnectionState::Encrypted);
    Metrics::incr(&inner.metrics.connections_total);
    inner.directory.mark_good(endpoint);
    info!("session encrypted");
    post(
        inner,
        CmEvent::Connected(ConnectedEvent {
            result: ResultCode::OK,
        }),
    );

    let (tx, mut rx) = mpsc::channel::<TxCommand>(64);
    *inner.tx.lock().expect("sender lock poisoned") = Some(tx);

    let heartbeat_interval = inner.config.heartbeat_interval;
    let idle_limit = heartbeat_interval * inner.config.idle_timeout_multiplier;
    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);

    let user = loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(TxCommand::Envelope(envelope)) => {
                    match chan.send_envelope(&envelope).await {
                        Ok(len) => {
                            Metrics::incr(&inner.metrics.messages_sent);
                            Metrics::add(&inner.metrics.bytes_sent, len as u64);
                        }
                        Err(e) => {
                            warn!(error = %e, "send failed");
                            break false;
                        }
                    }
                }
                Some(TxCommand::Disconnect) | None => {
                    let _ = chan.shutdown().await;
                    break true;
                }
            },
            inbound = chan.recv_envelope() => match inbound {
                Ok(Some(envelope)) => {
                    Metrics::incr(&inner.metrics.messages_received);
                    Metrics::add(&inner.metrics.bytes_received, envelope.body.len() as u64);
                    route_inbound(inner, envelope);
                }
                Ok(None) => {
                    info!("server closed the connection");
                    break false;
                }
                Err(e) => {
                    warn!(error = %e, "connection failed");
                    break false;
                }
            },
            _ = heartbeat.tick() => {
                if chan.idle_for() >= idle_limit {
                    warn!(silent_for = ?chan.idle_for(), "server silent past idle limit");
                    break false;
                }
                let mut ping = MessageEnvelope::new(MsgKind::Heartbeat, Vec::new());
                if let Some(identity) = *inner.session.lock().expect("session lock poisoned") {
                    ping.header.identity = identity.raw();
                }
                if let Err(e) = chan.send_envelope(&ping).await {
                    warn!(error = %e, "heartbeat send failed");
                    break false;
                }
            }
        }
    };

    *inner.tx.lock().expect("sender lock poisoned") = None;
    inner.jobs.fail_all(JobFailure::ConnectionLost);
    *inner.session.lock().expect("session lock poisoned") = None;
    set_state(inner, ConnectionState::Disconnected);

    let user = user || inner.user_disconnect.load(Ordering::SeqCst);
    post(
        inner,
        CmEvent::Disconnected(DisconnectedEvent {
            user_initiated: user,
        }),
    );
    SessionEnd::Ended { user }
}

/// Plaintext-to-encrypted transition: wait for the server's request,
/// answer it, and require an OK result before activating the channel.
async fn drive_handshake(inner: &Arc<ClientInner>, chan: &mut SessionChannel) -> Result<()> {
    // The client sends nothing until the server's unsolicited request
    let envelope = chan
        .recv_envelope()
        .await?
        .ok_or(CmError::ConnectionClosed)?;
    if envelope.kind() != MsgKind::ChannelEncryptRequest {
        return Err(CmError::Handshake(constants::ERR_UNEXPECTED_FRAME.into()));
    }
    let request = EncryptRequest::parse(&envelope.body)?;
    set_state(inner, ConnectionState::Handshaking);
    debug!(universe = ?request.universe, version = request.protocol_version, "encrypt request received");

    let (key, response) = respond_to_encrypt_request(&request, &inner.keys)?;
    chan.send_envelope(&MessageEnvelope::new(
        MsgKind::ChannelEncryptResponse,
        response.encode(),
    ))
    .await?;

    let envelope = chan
        .recv_envelope()
        .await?
        .ok_or(CmError::ConnectionClosed)?;
    if envelope.kind() != MsgKind::ChannelEncryptResult {
        return Err(CmError::Handshake(constants::ERR_UNEXPECTED_FRAME.into()));
    }
    let result = EncryptResult::parse(&envelope.body)?;
    if !result.result.is_ok() {
        return Err(CmError::HandshakeResult(result.result));
    }

    chan.activate(&key);
    Ok(())
}

fn route_inbound(inner: &ClientInner, envelope: MessageEnvelope) {
    if envelope.header.target_job != 0 && inner.jobs.dispatch(&envelope) {
        Metrics::incr(&inner.metrics.jobs_completed);
    }
    // Passive observers see every message, job-correlated or not
    post(inner, CmEvent::Message(envelope));
}
