//! # Broker Transport
//!
//! One STOMP session over a WebSocket, with reply correlation and a
//! supervised reconnect loop.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Broker Connection States                             │
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                              │                                 │
//! │        │                    CONNECTED │ ERROR / timeout                 │
//! │        │                        ┌─────┴─────┐                          │
//! │        │                        ▼           ▼                           │
//! │        │              ┌────────────┐  ┌────────────┐                   │
//! │        │              │ Connected  │  │ Backoff    │ (Supervisor)      │
//! │        │              └─────┬──────┘  └─────┬──────┘                   │
//! │        │                    │               │                           │
//! │        │          socket closed / error     │  timer expired            │
//! │        │                    ▼               │                           │
//! │        └──────────── maintain() ◄───────────┘                          │
//! │                                                                         │
//! │  READER TASK (one per session)                                         │
//! │  ──────────────────────────────                                        │
//! │  MESSAGE with correlation-id of a pending request → waiter (oneshot)   │
//! │  MESSAGE with model_class Operation / Event        → listener (mpsc)   │
//! │  anything else                                     → logged, dropped   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Replies are handed to their waiter directly on the reader task. A
//! listener that is itself waiting on a remote reply therefore never blocks
//! the delivery of that reply.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use garden_core::{MODEL_CLASS_EVENT, MODEL_CLASS_OPERATION};

use crate::error::{SyncError, SyncResult};
use crate::frame::{Command, Frame};
use crate::supervisor::{BackoffPolicy, Lifecycle, Readiness, Supervisor};

/// Transport headers of one message.
pub type Headers = BTreeMap<String, String>;

pub const HEADER_MODEL_CLASS: &str = "model_class";
pub const HEADER_REPLY_TO: &str = "reply-to";
pub const HEADER_CORRELATION_ID: &str = "correlation-id";
pub const HEADER_DESTINATION: &str = "destination";

/// WebSocket subprotocol for STOMP 1.2.
pub(crate) const STOMP_SUBPROTOCOL: &str = "v12.stomp";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, WsMessage>;
type WsReader = SplitStream<WsStream>;

// =============================================================================
// Transport State
// =============================================================================

/// Connection state of a broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// TLS material, already resolved to file paths.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub verify_host: bool,
}

/// Configuration for one broker connection.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Endpoints tried in order until one answers.
    pub endpoints: Vec<String>,

    pub username: Option<String>,
    pub password: Option<String>,

    /// STOMP `host` header override.
    pub virtual_host: Option<String>,

    /// Destinations (re)subscribed on every successful connect.
    pub subscriptions: Vec<String>,

    /// Default destination for outbound traffic without an explicit target.
    pub send_destination: Option<String>,

    pub connect_timeout: Duration,

    /// `(client sends every, client wants every)` in milliseconds.
    pub heartbeat: (u32, u32),

    /// `None` uses a plain connection for `ws://` and system roots for `wss://`.
    pub tls: Option<TlsConfig>,

    pub backoff: BackoffPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            endpoints: Vec::new(),
            username: None,
            password: None,
            virtual_host: None,
            subscriptions: Vec::new(),
            send_destination: None,
            connect_timeout: Duration::from_secs(10),
            heartbeat: (10_000, 0),
            tls: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

// =============================================================================
// Inbound Messages
// =============================================================================

/// A MESSAGE frame as the rest of the garden sees it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InboundMessage {
    pub headers: Headers,
    pub body: String,
}

impl InboundMessage {
    pub fn new(headers: Headers, body: impl Into<String>) -> Self {
        InboundMessage {
            headers,
            body: body.into(),
        }
    }

    fn from_frame(frame: Frame) -> Self {
        let mut headers = Headers::new();
        for (name, value) in frame.headers {
            headers.entry(name).or_insert(value);
        }
        InboundMessage {
            headers,
            body: frame.body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn model_class(&self) -> Option<&str> {
        self.header(HEADER_MODEL_CLASS)
    }

    /// True for anything that answers a request rather than starting one.
    pub fn is_reply(&self) -> bool {
        !matches!(
            self.model_class(),
            None | Some(MODEL_CLASS_OPERATION) | Some(MODEL_CLASS_EVENT)
        )
    }
}

// =============================================================================
// Pending Replies
// =============================================================================

/// Requests awaiting a correlated reply, keyed by `correlation-id`.
#[derive(Debug, Clone, Default)]
pub struct PendingReplies {
    waiters: Arc<DashMap<String, oneshot::Sender<InboundMessage>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh correlation id and its reply slot.
    pub fn register(&self) -> (String, oneshot::Receiver<InboundMessage>) {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(correlation_id.clone(), tx);
        (correlation_id, rx)
    }

    /// Hands `message` to its waiter. Returns false if nobody is waiting.
    pub fn complete(&self, correlation_id: &str, message: InboundMessage) -> bool {
        match self.waiters.remove(correlation_id) {
            Some((_, waiter)) => waiter.send(message).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, correlation_id: &str) {
        self.waiters.remove(correlation_id);
    }

    /// Drops every waiter; their receivers observe a closed channel.
    pub fn clear(&self) {
        self.waiters.clear();
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

// =============================================================================
// Message Sink
// =============================================================================

/// Anything that can carry an outbound message to a broker destination.
#[async_trait]
pub trait MessageSink: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Default destination for messages without `reply-to`.
    fn default_destination(&self) -> Option<String>;

    /// Best-effort send. Failures are logged, never returned.
    async fn send(&self, body: String, headers: Headers, destination: &str);
}

// =============================================================================
// Reader Task
// =============================================================================

/// Routes frames arriving on a session.
#[derive(Clone)]
struct Dispatcher {
    name: Arc<str>,
    pending: PendingReplies,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
}

impl Dispatcher {
    fn dispatch(&self, frame: Frame) {
        match frame.command {
            Command::Message => {
                let message = InboundMessage::from_frame(frame);

                if message.is_reply() {
                    let completed = message
                        .header(HEADER_CORRELATION_ID)
                        .map(str::to_string)
                        .map(|id| self.pending.complete(&id, message.clone()))
                        .unwrap_or(false);
                    if !completed {
                        debug!(
                            connection = %self.name,
                            model_class = ?message.model_class(),
                            correlation_id = ?message.header(HEADER_CORRELATION_ID),
                            "Dropping reply with no waiter"
                        );
                    }
                    return;
                }

                if self.inbound_tx.send(message).is_err() {
                    warn!(connection = %self.name, "Listener dropped, discarding message");
                }
            }
            Command::Error => {
                error!(
                    connection = %self.name,
                    broker_message = frame.get("message").unwrap_or_default(),
                    body = %frame.body,
                    "Broker reported an error"
                );
            }
            Command::Receipt => {
                debug!(connection = %self.name, receipt = ?frame.get("receipt-id"), "Receipt");
            }
            other => {
                debug!(connection = %self.name, command = %other, "Ignoring unexpected frame");
            }
        }
    }
}

struct Session {
    writer: Arc<Mutex<WsWriter>>,
    stop: CancellationToken,
    reader: JoinHandle<()>,
}

async fn read_loop(
    mut read: WsReader,
    writer: Arc<Mutex<WsWriter>>,
    dispatcher: Dispatcher,
    state_tx: watch::Sender<ConnectionState>,
    stop: CancellationToken,
    heartbeat: Option<Duration>,
) {
    let period = heartbeat.unwrap_or(Duration::from_secs(3600));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!(connection = %dispatcher.name, "Reader stopping");
                break;
            }

            _ = ticker.tick(), if heartbeat.is_some() => {
                let mut w = writer.lock().await;
                if let Err(e) = w.send(WsMessage::text("\n")).await {
                    warn!(connection = %dispatcher.name, error = %e, "Heart-beat failed");
                    break;
                }
            }

            next = read.next() => {
                match next {
                    Some(Ok(WsMessage::Text(text))) => match Frame::decode(&text) {
                        Ok(Some(frame)) => dispatcher.dispatch(frame),
                        Ok(None) => {}
                        Err(e) => warn!(connection = %dispatcher.name, error = %e, "Unreadable frame"),
                    },
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        match Frame::decode(&String::from_utf8_lossy(&bytes)) {
                            Ok(Some(frame)) => dispatcher.dispatch(frame),
                            Ok(None) => {}
                            Err(e) => warn!(connection = %dispatcher.name, error = %e, "Unreadable frame"),
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let mut w = writer.lock().await;
                        let _ = w.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(connection = %dispatcher.name, ?frame, "Broker closed the session");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(connection = %dispatcher.name, error = %e, "Broker socket error");
                        break;
                    }
                    None => {
                        info!(connection = %dispatcher.name, "Broker socket ended");
                        break;
                    }
                }
            }
        }
    }

    // replies for this session will not arrive on the next one; must run
    // before Disconnected wakes a reconnect
    dispatcher.pending.clear();
    state_tx.send_replace(ConnectionState::Disconnected);
}

// =============================================================================
// Broker Connection
// =============================================================================

/// A garden's session with its message broker.
///
/// ## Usage
/// ```rust,ignore
/// let (conn, inbound_rx) = BrokerConnection::new("parent", config.transport_config());
///
/// tokio::spawn(conn.clone().maintain(lifecycle.clone()));
///
/// while let Some(message) = inbound_rx.recv().await {
///     listener.on_message(message.headers, &message.body).await;
/// }
/// ```
pub struct BrokerConnection {
    config: TransportConfig,
    dispatcher: Dispatcher,
    state_tx: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    subscriptions: Mutex<Vec<String>>,
}

impl BrokerConnection {
    /// Creates a disconnected connection and the receiver its listener reads.
    pub fn new(
        name: impl Into<String>,
        config: TransportConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundMessage>) {
        // unbounded: the reader task must never wait on the listener
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let name: String = name.into();

        let conn = BrokerConnection {
            subscriptions: Mutex::new(config.subscriptions.clone()),
            config,
            dispatcher: Dispatcher {
                name: Arc::from(name.as_str()),
                pending: PendingReplies::new(),
                inbound_tx,
            },
            state_tx,
            session: Mutex::new(None),
        };

        (Arc::new(conn), inbound_rx)
    }

    pub fn name(&self) -> &str {
        &self.dispatcher.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn pending(&self) -> &PendingReplies {
        &self.dispatcher.pending
    }

    pub fn send_destination(&self) -> Option<&str> {
        self.config.send_destination.as_deref()
    }

    /// Opens a session on the first endpoint that answers.
    ///
    /// A no-op while already connected.
    pub async fn connect(&self) -> SyncResult<()> {
        let mut session = self.session.lock().await;

        if session.is_some() && self.is_connected() {
            return Ok(());
        }
        if let Some(stale) = session.take() {
            // the old reader finishes its cleanup before the new session opens
            stale.stop.cancel();
            let _ = stale.reader.await;
        }

        if self.config.endpoints.is_empty() {
            return Err(SyncError::InvalidConfig(
                "no broker endpoints configured".into(),
            ));
        }

        self.state_tx.send_replace(ConnectionState::Connecting);

        let mut last_error = None;
        for endpoint in &self.config.endpoints {
            match self.open(endpoint).await {
                Ok(opened) => {
                    info!(connection = %self.name(), endpoint = %endpoint, "Broker connected");
                    *session = Some(opened);
                    self.state_tx.send_replace(ConnectionState::Connected);
                    return Ok(());
                }
                Err(e) => {
                    debug!(connection = %self.name(), endpoint = %endpoint, error = %e, "Endpoint failed");
                    last_error = Some(e);
                }
            }
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        Err(last_error.unwrap_or(SyncError::Disconnected))
    }

    /// Adds `destination` to the subscription set, subscribing now if the
    /// session is up.
    pub async fn subscribe(&self, destination: &str) -> SyncResult<()> {
        let id = {
            let mut subscriptions = self.subscriptions.lock().await;
            match subscriptions.iter().position(|d| d == destination) {
                Some(index) => index,
                None => {
                    subscriptions.push(destination.to_string());
                    subscriptions.len() - 1
                }
            }
        };

        let session = self.session.lock().await;
        if let Some(session) = session.as_ref().filter(|_| self.is_connected()) {
            let frame = subscribe_frame(destination, id);
            session
                .writer
                .lock()
                .await
                .send(WsMessage::text(frame.encode()))
                .await?;
            info!(connection = %self.name(), destination, "Subscribed");
        }
        Ok(())
    }

    /// Sends one SEND frame, reporting failures to the caller.
    pub async fn try_send(&self, body: String, headers: Headers, destination: &str) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::Disconnected);
        }

        let frame = Frame::new(Command::Send)
            .header(HEADER_DESTINATION, destination)
            .headers(headers)
            .body(body);

        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(SyncError::Disconnected)?;
        session
            .writer
            .lock()
            .await
            .send(WsMessage::text(frame.encode()))
            .await?;

        debug!(connection = %self.name(), destination, "Sent");
        Ok(())
    }

    /// Sends DISCONNECT and closes the socket. Idempotent.
    pub async fn disconnect(&self) {
        let session = self.session.lock().await.take();

        if let Some(session) = session {
            {
                let mut writer = session.writer.lock().await;
                let frame = Frame::new(Command::Disconnect);
                let _ = writer.send(WsMessage::text(frame.encode())).await;
                let _ = writer.close().await;
            }
            session.stop.cancel();
            let _ = session.reader.await;
            info!(connection = %self.name(), "Broker disconnected");
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.dispatcher.pending.clear();
    }

    /// Keeps the session up until `lifecycle` stops, then disconnects.
    pub async fn maintain(self: Arc<Self>, lifecycle: Lifecycle) {
        let supervisor = Supervisor::new(self.config.backoff);

        loop {
            let conn = self.clone();
            let readiness = supervisor
                .run(
                    move || {
                        let conn = conn.clone();
                        async move {
                            match conn.connect().await {
                                Ok(()) => true,
                                Err(e) => {
                                    debug!(connection = %conn.name(), error = %e, "Connect attempt failed");
                                    false
                                }
                            }
                        }
                    },
                    &lifecycle,
                    "Unable to connect to the broker, is it started?",
                )
                .await;

            if readiness == Readiness::Stopped {
                break;
            }

            tokio::select! {
                _ = self.session_closed() => {
                    warn!(connection = %self.name(), "Broker session lost, reconnecting");
                }
                _ = lifecycle.stopped() => break,
            }
        }

        self.disconnect().await;
    }

    /// Resolves once the state leaves `Connected`.
    async fn session_closed(&self) {
        let mut state_rx = self.watch_state();
        loop {
            let connected = *state_rx.borrow_and_update() == ConnectionState::Connected;
            if !connected || state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    // =========================================================================
    // Session Setup
    // =========================================================================

    async fn open(&self, endpoint: &str) -> SyncResult<Session> {
        let url = Url::parse(endpoint)?;
        let host = self
            .config
            .virtual_host
            .clone()
            .or_else(|| url.host_str().map(String::from))
            .unwrap_or_else(|| "/".to_string());

        let mut request = endpoint.into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(STOMP_SUBPROTOCOL));

        let connector = self.tls_connector()?;
        let connect_timeout = self.config.connect_timeout;

        let (ws_stream, response) = timeout(
            connect_timeout,
            connect_async_tls_with_config(request, None, false, connector),
        )
        .await
        .map_err(|_| SyncError::Timeout(connect_timeout))??;
        debug!(status = ?response.status(), "WebSocket handshake complete");

        let (mut write, mut read) = ws_stream.split();

        write
            .send(WsMessage::text(self.connect_frame(&host).encode()))
            .await?;

        timeout(connect_timeout, await_connected(&mut read))
            .await
            .map_err(|_| SyncError::Timeout(connect_timeout))??;

        let subscriptions = self.subscriptions.lock().await.clone();
        for (id, destination) in subscriptions.iter().enumerate() {
            write
                .send(WsMessage::text(subscribe_frame(destination, id).encode()))
                .await?;
            info!(connection = %self.name(), destination = %destination, "Subscribed");
        }

        let writer = Arc::new(Mutex::new(write));
        let stop = CancellationToken::new();
        let heartbeat = match self.config.heartbeat.0 {
            0 => None,
            ms => Some(Duration::from_millis(u64::from(ms))),
        };

        let reader = tokio::spawn(read_loop(
            read,
            writer.clone(),
            self.dispatcher.clone(),
            self.state_tx.clone(),
            stop.clone(),
            heartbeat,
        ));

        Ok(Session {
            writer,
            stop,
            reader,
        })
    }

    fn connect_frame(&self, host: &str) -> Frame {
        let (send_ms, recv_ms) = self.config.heartbeat;
        let mut frame = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", format!("{},{}", send_ms, recv_ms));

        if let Some(username) = &self.config.username {
            frame = frame
                .header("login", username.as_str())
                .header("passcode", self.config.password.clone().unwrap_or_default())
                .header("client-id", username.as_str());
        }
        frame
    }

    fn tls_connector(&self) -> SyncResult<Option<Connector>> {
        let Some(tls) = &self.config.tls else {
            return Ok(None);
        };

        let read_pem = |path: &PathBuf| {
            std::fs::read(path)
                .map_err(|e| SyncError::TlsError(format!("{}: {}", path.display(), e)))
        };

        let mut builder = native_tls::TlsConnector::builder();

        if let Some(ca) = &tls.ca_cert {
            builder.add_root_certificate(native_tls::Certificate::from_pem(&read_pem(ca)?)?);
        }

        if let (Some(cert), Some(key)) = (&tls.client_cert, &tls.client_key) {
            let identity = native_tls::Identity::from_pkcs8(&read_pem(cert)?, &read_pem(key)?)?;
            builder.identity(identity);
        }

        builder.danger_accept_invalid_hostnames(!tls.verify_host);

        Ok(Some(Connector::NativeTls(builder.build()?)))
    }
}

#[async_trait]
impl MessageSink for BrokerConnection {
    fn is_connected(&self) -> bool {
        BrokerConnection::is_connected(self)
    }

    fn default_destination(&self) -> Option<String> {
        self.config.send_destination.clone()
    }

    async fn send(&self, body: String, headers: Headers, destination: &str) {
        if let Err(e) = self.try_send(body, headers, destination).await {
            warn!(
                connection = %self.name(),
                destination,
                error = %e,
                "Message not sent, broker connection is down"
            );
        }
    }
}

fn subscribe_frame(destination: &str, id: usize) -> Frame {
    Frame::new(Command::Subscribe)
        .header("id", format!("sub-{}", id))
        .header(HEADER_DESTINATION, destination)
        .header("ack", "auto")
        .header("subscription-type", "MULTICAST")
        .header("durable-subscription-name", destination)
}

async fn await_connected(read: &mut WsReader) -> SyncResult<()> {
    while let Some(next) = read.next().await {
        let text = match next? {
            WsMessage::Text(text) => text.as_str().to_string(),
            WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            WsMessage::Close(_) => return Err(SyncError::Disconnected),
            _ => continue,
        };

        match Frame::decode(&text)? {
            Some(frame) if frame.command == Command::Connected => {
                debug!(version = ?frame.get("version"), "STOMP session established");
                return Ok(());
            }
            Some(frame) if frame.command == Command::Error => {
                let message = frame.get("message").unwrap_or("connection refused");
                return Err(SyncError::BrokerError(message.to_string()));
            }
            _ => continue,
        }
    }
    Err(SyncError::Disconnected)
}
