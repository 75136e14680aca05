// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Websocket front end.
//!
//! Each accepted socket must open with a `hello`. A device hello creates or
//! rejoins a session and emits a [`SessionReady`] event; a server hello only
//! attaches to a session that already exists. After the handshake every frame
//! read from the socket goes through the session's [`SocketTransport`], so
//! backup-share messages are intercepted before the round driver sees them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use tandem_core::backup::{BackupInterceptor, BackupPipeline};
use tandem_core::coordinator::{
    Coordinator, DkgRequest, DkgResult, RefreshRequest, RefreshResult, SignRequest,
    WalletMetadata,
};
use tandem_core::crypto::KeyEncryptor;
use tandem_core::driver::{DriveMode, DriverConfig};
use tandem_core::engine::{ProtocolContext, ProtocolEngine, SignatureFormat, KEY_ID_SIZE};
use tandem_core::storage::{CoordinatorStorage, SessionRecord};
use tandem_core::transport::{
    Connection, Frame, SocketTransport, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR,
};
use tandem_core::types::{Participant, ProtocolKind};

use crate::error::{Result, ServerError};
use crate::handshake::{HandshakeError, Hello, SessionIntent};
use crate::registry::{LiveSession, SessionRegistry, SessionState};

type WsStream = WebSocketStream<TcpStream>;

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen: SocketAddr,
    /// Lifetime of the persisted session record.
    pub session_ttl: Duration,
    /// Sockets that send no hello within this window are closed.
    pub hello_timeout: Duration,
    pub driver: DriverConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            session_ttl: DEFAULT_SESSION_TTL,
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
            driver: DriverConfig::default(),
        }
    }
}

/// Emitted when a device says hello.
pub struct SessionReady {
    pub session_id: String,
    pub token: Option<String>,
    pub intent: SessionIntent,
    pub handle: SessionHandle,
}

/// How the post-DKG backup grace window ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupWindow {
    Received,
    Closed,
    Elapsed,
}

struct Shared {
    registry: SessionRegistry,
    coordinator: Coordinator,
    pipeline: Arc<BackupPipeline>,
    engine: Arc<dyn ProtocolEngine>,
    events: mpsc::UnboundedSender<SessionReady>,
    session_ttl: Duration,
    hello_timeout: Duration,
}

pub struct CoordinatorServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinatorServer {
    /// Binds the listener and starts accepting. Session events arrive on the returned receiver.
    pub async fn bind(
        options: ServerOptions,
        storage: Arc<dyn CoordinatorStorage>,
        encryptor: Arc<dyn KeyEncryptor>,
        engine: Arc<dyn ProtocolEngine>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionReady>)> {
        let listener = TcpListener::bind(options.listen).await?;
        let local_addr = listener.local_addr()?;
        let (events, ready) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            registry: SessionRegistry::new(),
            coordinator: Coordinator::new(storage.clone(), encryptor.clone())
                .with_driver_config(options.driver),
            pipeline: Arc::new(BackupPipeline::new(storage, encryptor)),
            engine,
            events,
            session_ttl: options.session_ttl,
            hello_timeout: options.hello_timeout,
        });
        let accept = tokio::spawn(accept_loop(listener, shared.clone()));
        info!(addr = %local_addr, "coordinator listening");

        Ok((
            Self {
                shared,
                local_addr,
                accept: Mutex::new(Some(accept)),
            },
            ready,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.shared.registry
    }

    pub fn session(&self, session_id: &str) -> Option<SessionHandle> {
        self.shared.registry.get(session_id).map(|session| SessionHandle {
            session,
            shared: self.shared.clone(),
        })
    }

    /// Stops accepting and closes every live session. Returns how many were closed.
    pub fn shutdown(&self) -> usize {
        if let Some(accept) = self.accept.lock().take() {
            accept.abort();
        }
        let closed = self.shared.registry.cleanup_all();
        info!(sessions = closed, "coordinator shut down");
        closed
    }
}

impl Drop for CoordinatorServer {
    fn drop(&mut self) {
        if let Some(accept) = self.accept.lock().take() {
            accept.abort();
        }
    }
}

/// Application-facing handle to one session.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<LiveSession>,
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        self.session.session_id()
    }

    pub fn intent(&self) -> SessionIntent {
        self.session.intent()
    }

    pub fn token(&self) -> Option<String> {
        self.session.token()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn ctx(&self) -> &Arc<dyn ProtocolContext> {
        self.session.ctx()
    }

    pub fn transport(&self) -> &Arc<SocketTransport> {
        self.session.transport()
    }

    fn engine_session_id(&self, intent: &SessionIntent) -> String {
        intent
            .session_id_hint()
            .unwrap_or(self.session_id())
            .to_string()
    }

    fn wrong_intent(&self, expected: ProtocolKind, intent: &SessionIntent) -> ServerError {
        ServerError::WrongIntent {
            session_id: self.session_id().to_string(),
            expected: expected.as_str(),
            actual: intent.kind().as_str(),
        }
    }

    /// Protocol failures are fatal to the session.
    fn settle<T>(&self, kind: ProtocolKind, result: tandem_core::Result<T>) -> Result<T> {
        result.map_err(|e| {
            error!(session_id = %self.session_id(), protocol = %kind, error = %e, "protocol failed");
            self.close();
            e.into()
        })
    }

    /// Runs DKG with the coordinator as the server party.
    pub async fn run_dkg(&self, metadata: Option<WalletMetadata>) -> Result<DkgResult> {
        let intent = self.intent();
        let SessionIntent::Dkg { key_id, .. } = &intent else {
            return Err(self.wrong_intent(ProtocolKind::Dkg, &intent));
        };
        let _guard = self.session.lock_driver().await;
        if !self.session.activate() {
            return Err(ServerError::SessionClosed(self.session_id().to_string()));
        }

        let request = DkgRequest {
            key_id: key_id.as_deref().and_then(parse_key_id),
            session_id: Some(self.engine_session_id(&intent)),
            mode: DriveMode::ServerOnly,
            metadata,
        };
        let result = self
            .shared
            .coordinator
            .run_dkg(self.ctx().as_ref(), self.transport().as_ref(), request)
            .await;
        self.settle(ProtocolKind::Dkg, result)
    }

    /// Signs `message` with the stored server share for the intent's key id.
    pub async fn run_sign(&self, message: &[u8], format: SignatureFormat) -> Result<Vec<u8>> {
        let intent = self.intent();
        let SessionIntent::Sign { key_id, .. } = &intent else {
            return Err(self.wrong_intent(ProtocolKind::Sign, &intent));
        };
        let _guard = self.session.lock_driver().await;
        if !self.session.activate() {
            return Err(ServerError::SessionClosed(self.session_id().to_string()));
        }

        let request = SignRequest {
            message: message.to_vec(),
            format,
            session_id: Some(self.engine_session_id(&intent)),
            wallet_id: Some(key_id.clone()),
            ..Default::default()
        };
        let result = self
            .shared
            .coordinator
            .run_sign(self.ctx().as_ref(), self.transport().as_ref(), request)
            .await;
        self.settle(ProtocolKind::Sign, result)
    }

    pub async fn run_refresh(&self) -> Result<RefreshResult> {
        let intent = self.intent();
        let SessionIntent::Refresh { key_id, .. } = &intent else {
            return Err(self.wrong_intent(ProtocolKind::Refresh, &intent));
        };
        let _guard = self.session.lock_driver().await;
        if !self.session.activate() {
            return Err(ServerError::SessionClosed(self.session_id().to_string()));
        }

        let request = RefreshRequest {
            session_id: Some(self.engine_session_id(&intent)),
            wallet_id: Some(key_id.clone()),
            ..Default::default()
        };
        let result = self
            .shared
            .coordinator
            .run_refresh(self.ctx().as_ref(), self.transport().as_ref(), request)
            .await;
        self.settle(ProtocolKind::Refresh, result)
    }

    /// Waits for a backup share to be stored, the session to close, or `grace` to pass.
    pub async fn await_backup(&self, grace: Duration) -> BackupWindow {
        let closed = self.session.closed().notified();
        if self.session.is_closed() {
            return BackupWindow::Closed;
        }
        tokio::select! {
            _ = self.session.backup_stored().notified() => BackupWindow::Received,
            _ = closed => BackupWindow::Closed,
            _ = tokio::time::sleep(grace) => BackupWindow::Elapsed,
        }
    }

    /// Removes the session and releases its engine context. Safe to call
    /// repeatedly; a newer session that reused the id is not touched.
    pub fn close(&self) -> bool {
        self.shared
            .registry
            .cleanup_if(self.session_id(), &self.session)
    }
}

fn parse_key_id(value: &str) -> Option<[u8; KEY_ID_SIZE]> {
    hex::decode(value.trim()).ok()?.try_into().ok()
}

impl Shared {
    fn new_session(&self, hello: &Hello) -> LiveSession {
        LiveSession::new(
            hello.session_id.clone(),
            hello.intent.clone(),
            hello.token.clone(),
            Arc::new(SocketTransport::new()),
            self.engine.context(),
            Arc::new(tokio::sync::Notify::new()),
        )
    }

    async fn register(
        self: &Arc<Self>,
        hello: &Hello,
        connection: Connection,
    ) -> std::result::Result<Arc<LiveSession>, HandshakeError> {
        match hello.role {
            Participant::Server => {
                let session = self.registry.get(&hello.session_id).ok_or_else(|| {
                    HandshakeError::Contents("server role for unknown session".into())
                })?;
                if let Some(old) = session.transport().attach(Participant::Server, connection) {
                    old.close(CLOSE_NORMAL, "replaced by new connection");
                }
                info!(session_id = %hello.session_id, "server participant attached");
                Ok(session)
            }
            Participant::Device => {
                let (session, created) = self
                    .registry
                    .get_or_create(&hello.session_id, || self.new_session(hello));
                if !created {
                    session.update(hello.intent.clone(), hello.token.clone());
                }
                session
                    .transport()
                    .set_interceptor(Arc::new(BackupInterceptor::new(
                        self.pipeline.clone(),
                        hello.intent.key_id().map(str::to_string),
                        session.backup_stored_handle(),
                    )));
                if let Some(old) = session.transport().attach(Participant::Device, connection) {
                    old.close(CLOSE_NORMAL, "replaced by new connection");
                }

                if created {
                    self.persist(hello).await;
                }
                info!(
                    session_id = %hello.session_id,
                    intent = %hello.intent.kind(),
                    created,
                    "device registered"
                );

                let ready = SessionReady {
                    session_id: hello.session_id.clone(),
                    token: hello.token.clone(),
                    intent: hello.intent.clone(),
                    handle: SessionHandle {
                        session: session.clone(),
                        shared: self.clone(),
                    },
                };
                if self.events.send(ready).is_err() {
                    debug!(session_id = %hello.session_id, "no listener for session events");
                }
                Ok(session)
            }
        }
    }

    async fn persist(&self, hello: &Hello) {
        let ttl = chrono::Duration::from_std(self.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let record = SessionRecord {
            session_id: hello.session_id.clone(),
            wallet_id: hello.intent.key_id().map(str::to_string),
            kind: hello.intent.kind(),
            state: json!({
                "intent": hello.intent,
                "hasToken": hello.token.is_some(),
            }),
            expires_at: Utc::now() + ttl,
        };
        if let Err(e) = self.coordinator.storage().save_session(record).await {
            warn!(session_id = %hello.session_id, error = %e, "failed to persist session record");
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(shared, stream, peer).await {
                        debug!(%peer, error = %e, "connection ended with error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();

    let hello_wait = tokio::time::timeout(shared.hello_timeout, next_payload(&mut source));
    let first = match hello_wait.await {
        Ok(first) => first?,
        Err(_) => {
            warn!(%peer, "no hello before timeout");
            reject(&mut sink, &HandshakeError::Timeout).await;
            return Ok(());
        }
    };
    let Some(first) = first else {
        return Ok(());
    };
    let hello = match Hello::parse(&first) {
        Ok(hello) => hello,
        Err(e) => {
            warn!(%peer, error = %e, "handshake rejected");
            reject(&mut sink, &e).await;
            return Ok(());
        }
    };

    let (connection, outbound) = Connection::channel();
    let session = match shared.register(&hello, connection.clone()).await {
        Ok(session) => session,
        Err(e) => {
            warn!(%peer, session_id = %hello.session_id, error = %e, "handshake rejected");
            reject(&mut sink, &e).await;
            return Ok(());
        }
    };
    let role = hello.role;
    let writer = tokio::spawn(write_frames(sink, outbound));

    let result = read_frames(&mut source, &session, role).await;

    connection.mark_closed();
    let was_current = session.transport().detach(role, &connection);
    if role == Participant::Device && was_current {
        debug!(session_id = %hello.session_id, "device disconnected");
        shared.registry.cleanup_if(&hello.session_id, &session);
    }
    writer.abort();
    result
}

/// Next text or binary payload; `None` once the peer closes.
async fn next_payload(source: &mut SplitStream<WsStream>) -> Result<Option<Vec<u8>>> {
    while let Some(message) = source.next().await {
        match message? {
            Message::Text(text) => return Ok(Some(text.into_bytes())),
            Message::Binary(bytes) => return Ok(Some(bytes)),
            Message::Close(_) => return Ok(None),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    Ok(None)
}

async fn read_frames(
    source: &mut SplitStream<WsStream>,
    session: &LiveSession,
    role: Participant,
) -> Result<()> {
    while let Some(payload) = next_payload(source).await? {
        if let Err(e) = session.transport().on_inbound(role, payload).await {
            warn!(session_id = %session.session_id(), %role, error = %e, "inbound frame dropped");
        }
    }
    Ok(())
}

async fn write_frames(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = outbound.recv().await {
        let (message, last) = match frame {
            Frame::Text(text) => (Message::Text(text), false),
            Frame::Binary(bytes) => (Message::Binary(bytes), false),
            Frame::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                })),
                true,
            ),
        };
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "socket write failed");
            break;
        }
        if last {
            break;
        }
    }
}

async fn reject(sink: &mut SplitSink<WsStream, Message>, e: &HandshakeError) {
    let frame = CloseFrame {
        code: CloseCode::from(CLOSE_PROTOCOL_ERROR),
        reason: e.close_reason().into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}
