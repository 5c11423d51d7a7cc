use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use dertunnel_common::validate::{is_valid_endpoint, is_valid_user};
use dertunnel_common::{
    byte_queue, random_id, sleep_until_opt, spawn_frame_writer, ByteReceiver, HttpInspector,
    InspectorError, Keepalive, KeepaliveConfig, PeerStatus, ProtocolData, ProtocolDataKind,
    QueueError, DEFAULT_SOCKET_BUFFER,
};
use dertunnel_protocol::{
    ChannelClose, Frame, FrameCodec, HelloRequest, HelloResponse, Message, MessageError,
    MessageType, ServerOpen, PROTOCOL_VERSION,
};

use crate::auth::Authenticator;
use crate::error::{DispatchError, HelloError};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::state::{
    ChannelCounters, ChannelIdGenerator, ClientConnection, ClientInfo, Endpoint, EndpointInfo,
    EndpointSummary, TaggedSocket,
};

/// Announced to clients in HELLO_RESP
pub const SERVER_INFO: &str = "DerTunnel";

/// Attempts at finding a free `<prefix>-<suffix>` name
const MAX_PREFIX_ATTEMPTS: usize = 42;

const PREFIX_SUFFIX_LEN: usize = 8;

const READ_BUF_SIZE: usize = 16 * 1024;

const STATE_VIOLATION: &str = "Invalid client state for message type";

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Endpoints are published as `<name>.<base_domain>`
    pub base_domain: String,
    pub keepalive: KeepaliveConfig,
    pub rate_limit: RateLimitConfig,
    /// Let a user claim a fixed endpoint held by a different user
    pub allow_foreign_takeover: bool,
    /// Log HTTP exchanges seen on visitor channels
    pub inspect_traffic: bool,
    /// Time allowed for flushing a closing control connection
    pub close_grace: Duration,
    /// Client data buffered for one visitor before the channel is dropped
    pub channel_buffer: usize,
}

impl DispatcherConfig {
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: base_domain.into(),
            keepalive: KeepaliveConfig::default(),
            rate_limit: RateLimitConfig::default(),
            allow_foreign_takeover: false,
            inspect_traffic: false,
            close_grace: Duration::from_secs(5),
            channel_buffer: DEFAULT_SOCKET_BUFFER,
        }
    }
}

enum EndpointRequest {
    Fixed(String),
    Prefixed(String),
}

/// Owns all control connections, endpoints and visitor channels
pub struct ConnectionDispatcher {
    config: DispatcherConfig,
    authenticator: Arc<dyn Authenticator>,
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
    channel_ids: ChannelIdGenerator,
    connection_ids: AtomicU64,
    limiter: RateLimiter,
}

impl ConnectionDispatcher {
    pub fn new(config: DispatcherConfig, authenticator: Arc<dyn Authenticator>) -> Arc<Self> {
        let limiter = RateLimiter::new(config.rate_limit);
        Arc::new(Self {
            config,
            authenticator,
            endpoints: RwLock::new(HashMap::new()),
            channel_ids: ChannelIdGenerator::new(),
            connection_ids: AtomicU64::new(1),
            limiter,
        })
    }

    pub fn base_domain(&self) -> &str {
        &self.config.base_domain
    }

    /// Serve a tunnel client control connection until it closes
    pub async fn on_client_connect<S>(self: Arc<Self>, stream: S, remote: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = self.connection_ids.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = tokio::io::split(stream);
        let kill = CancellationToken::new();
        let (sender, writer) = spawn_frame_writer(write_half, kill.clone());
        let conn = Arc::new(ClientConnection::new(id, remote, sender, kill));
        tracing::debug!("Control connection {} from {}", id, remote);

        let mut session = ControlSession {
            dispatcher: self.clone(),
            conn: conn.clone(),
            state: ConnectionState::New,
            endpoint: None,
            keepalive: None,
        };
        session.run(read_half).await;

        // Teardown: unpublish, flush, then cascade to all channels
        if let Some(endpoint) = session.endpoint.take() {
            self.release_endpoint(&endpoint);
            tracing::info!("Client disconnected: {}@{}", endpoint.name, conn.user());
        }
        writer.close(self.config.close_grace).await;
        conn.destroy();
    }

    /// Forward a visitor connection to the client owning `name`
    ///
    /// An unknown endpoint drops the stream right away.
    pub async fn on_endpoint_connect<S>(
        self: Arc<Self>,
        name: &str,
        stream: S,
        remote: SocketAddr,
    ) -> Result<(), DispatchError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let endpoint = self.endpoints.read().get(&name.to_lowercase()).cloned();
        let Some(endpoint) = endpoint else {
            return Err(DispatchError::UnknownEndpoint(name.to_string()));
        };
        self.run_channel(endpoint, stream, remote).await;
        Ok(())
    }

    /// Snapshot of all endpoints, sorted by name
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let mut list: Vec<_> = self.endpoints.read().values().map(|e| e.info()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Snapshot of all endpoints grouped by user
    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut users: BTreeMap<String, Vec<EndpointSummary>> = BTreeMap::new();
        for info in self.endpoints() {
            users.entry(info.user).or_default().push(EndpointSummary {
                name: info.name,
                active_connections: info.active_connections,
                bytes_sent: info.bytes_sent,
                bytes_received: info.bytes_received,
            });
        }
        users
            .into_iter()
            .map(|(name, endpoints)| ClientInfo { name, endpoints })
            .collect()
    }

    /// Drop an endpoint and destroy the client connection owning it
    pub fn remove_endpoint(&self, name: &str) -> bool {
        let removed = self.endpoints.write().remove(&name.to_lowercase());
        match removed {
            Some(endpoint) => {
                tracing::info!("Removing endpoint {}@{}", endpoint.name, endpoint.owner.user());
                endpoint.owner.destroy();
                true
            }
            None => false,
        }
    }

    /// Validate a HELLO_REQ and claim the requested endpoint
    ///
    /// On success the HELLO_RESP is already queued, ahead of any SERVER_OPEN.
    async fn hello(
        &self,
        conn: &Arc<ClientConnection>,
        hello: HelloRequest,
    ) -> Result<Arc<Endpoint>, HelloError> {
        if hello.version != PROTOCOL_VERSION {
            return Err(HelloError::Version);
        }
        if !is_valid_user(&hello.user) {
            return Err(HelloError::InvalidUser);
        }
        let user = hello.user.to_lowercase();
        if !self
            .limiter
            .consume(&format!("{}:{}", conn.remote.ip(), user))
        {
            return Err(HelloError::RateLimited);
        }
        if hello.token.is_empty() {
            return Err(HelloError::MissingToken);
        }

        let fixed = hello.endpoint.filter(|e| !e.is_empty());
        let prefix = hello.endpoint_prefix.filter(|p| !p.is_empty());
        let requested = fixed.as_deref().or(prefix.as_deref()).unwrap_or_default();
        if !is_valid_endpoint(requested) {
            return Err(HelloError::InvalidEndpoint(requested.to_string()));
        }

        if !self.authenticator.authenticate(&hello.user, &hello.token).await {
            return Err(HelloError::InvalidCredentials);
        }
        conn.set_user(user);

        let request = match (fixed, prefix) {
            (Some(name), _) => EndpointRequest::Fixed(name.to_lowercase()),
            (None, Some(prefix)) => EndpointRequest::Prefixed(prefix.to_lowercase()),
            (None, None) => return Err(HelloError::Internal),
        };
        self.claim_endpoint(conn, request)
    }

    fn claim_endpoint(
        &self,
        conn: &Arc<ClientConnection>,
        request: EndpointRequest,
    ) -> Result<Arc<Endpoint>, HelloError> {
        let mut endpoints = self.endpoints.write();

        let (name, evicted) = match request {
            EndpointRequest::Fixed(name) => {
                let evicted = endpoints.get(&name).cloned();
                if let Some(existing) = &evicted {
                    if existing.owner.user() != conn.user() && !self.config.allow_foreign_takeover {
                        return Err(HelloError::EndpointInUse);
                    }
                }
                (name, evicted)
            }
            EndpointRequest::Prefixed(prefix) => {
                let name = (0..MAX_PREFIX_ATTEMPTS)
                    .map(|_| format!("{}-{}", prefix, random_id(PREFIX_SUFFIX_LEN)))
                    .find(|candidate| !endpoints.contains_key(candidate))
                    .ok_or(HelloError::Internal)?;
                (name, None)
            }
        };

        let response = HelloResponse::accepted(
            format!("{}.{}", name, self.config.base_domain),
            SERVER_INFO,
        );
        if conn.sender.try_send(Message::HelloResp(response)).is_err() {
            return Err(HelloError::Internal);
        }

        if let Some(previous) = evicted {
            tracing::info!(
                "Endpoint {} taken over by {}@{}, evicting {}",
                name,
                conn.user(),
                conn.remote,
                previous.owner.remote
            );
            previous.owner.destroy();
        }

        let endpoint = Arc::new(Endpoint::new(name.clone(), conn.clone()));
        endpoints.insert(name, endpoint.clone());
        Ok(endpoint)
    }

    /// Unpublish `endpoint` unless someone else has claimed the name since
    fn release_endpoint(&self, endpoint: &Arc<Endpoint>) {
        let mut endpoints = self.endpoints.write();
        if endpoints
            .get(&endpoint.name)
            .is_some_and(|current| Arc::ptr_eq(current, endpoint))
        {
            endpoints.remove(&endpoint.name);
        }
    }

    async fn run_channel<S>(&self, endpoint: Arc<Endpoint>, stream: S, remote: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let owner = endpoint.owner.clone();
        let channel_id = self.channel_ids.next();
        let kill = owner.kill.child_token();
        let done = CancellationToken::new();
        let counters = Arc::new(ChannelCounters::default());

        let (mut read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = byte_queue(self.config.channel_buffer);
        endpoint.channels.insert(
            channel_id,
            TaggedSocket {
                channel_id,
                remote,
                writer: tx,
                kill: kill.clone(),
                counters: counters.clone(),
            },
        );

        let open = Message::ServerOpen(ServerOpen {
            channel_id,
            client: remote.to_string(),
        });
        if owner.sender.send(open).await.is_err() {
            endpoint.channels.remove(&channel_id);
            return;
        }
        tracing::debug!(
            "Channel {} opened on {} for {}",
            channel_id,
            endpoint.name,
            remote
        );

        let (mut requests, responses) = if self.config.inspect_traffic {
            let (req, res) = HttpInspector::pair();
            (Some(req), Some(res))
        } else {
            (None, None)
        };
        let label = format!("{}:{}", endpoint.name, channel_id);

        let write_task = tokio::spawn(write_channel(
            write_half,
            rx,
            kill.clone(),
            done.clone(),
            responses,
            label.clone(),
        ));

        let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
        loop {
            buf.reserve(READ_BUF_SIZE);
            let read = tokio::select! {
                _ = kill.cancelled() => break,
                _ = done.cancelled() => break,
                res = read_half.read_buf(&mut buf) => res,
            };
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("Channel {} read error: {}", channel_id, e);
                    break;
                }
            };

            counters.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            owner.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            let data = buf.split().freeze();
            if let Some(inspector) = requests.as_mut() {
                log_inspection(&label, inspector.feed(&data));
            }

            // Not reading again until the control connection has room
            let forwarded = tokio::select! {
                _ = kill.cancelled() => break,
                res = owner.sender.send(Message::ServerData { channel: channel_id, data }) => res,
            };
            if forwarded.is_err() {
                break;
            }
        }

        // Still registered means the client has not closed this channel
        let registered = endpoint.channels.remove(&channel_id).is_some();
        if registered && !kill.is_cancelled() {
            let close = Message::ServerClose(ChannelClose { channel_id });
            let _ = owner.sender.send(close).await;
        }
        if kill.is_cancelled() {
            write_task.abort();
        } else {
            let _ = write_task.await;
        }
        tracing::debug!("Channel {} closed", channel_id);
    }
}

/// Drain client data into the visitor socket, then close it
async fn write_channel<W>(
    mut write_half: W,
    mut rx: ByteReceiver,
    kill: CancellationToken,
    done: CancellationToken,
    mut inspector: Option<HttpInspector>,
    label: String,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let queued = tokio::select! {
            biased;
            _ = kill.cancelled() => return,
            queued = rx.recv() => queued,
        };
        let Some(queued) = queued else { break };
        if let Some(inspector) = inspector.as_mut() {
            log_inspection(&label, inspector.feed(&queued.data));
        }
        if let Err(e) = write_half.write_all(&queued.data).await {
            tracing::debug!("Channel {} write error: {}", label, e);
            done.cancel();
            return;
        }
    }
    let _ = write_half.shutdown().await;
    done.cancel();
}

fn log_inspection(label: &str, result: Result<Vec<ProtocolData>, InspectorError>) {
    match result {
        Ok(events) => {
            for event in events {
                match event.kind {
                    ProtocolDataKind::HttpRequestHeader => {
                        tracing::info!("[{}] {} {}", label, event.method, event.path)
                    }
                    ProtocolDataKind::HttpResponseHeader => tracing::info!(
                        "[{}] {} {} -> {} {}",
                        label,
                        event.method,
                        event.path,
                        event.status,
                        event.status_text
                    ),
                    ProtocolDataKind::HttpRequestBody | ProtocolDataKind::HttpResponseBody => {
                        tracing::debug!(
                            "[{}] {} body: {} bytes",
                            label,
                            event.id,
                            event.body_len
                        )
                    }
                }
            }
        }
        Err(e) => tracing::debug!("[{}] {}", label, e),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    New,
    Active,
    Ended,
}

enum Flow {
    Continue,
    Close,
}

enum Event {
    Killed,
    Read(std::io::Result<usize>),
    PingDue,
    PongOverdue,
}

/// Protocol state of one control connection, owned by its task
struct ControlSession {
    dispatcher: Arc<ConnectionDispatcher>,
    conn: Arc<ClientConnection>,
    state: ConnectionState,
    endpoint: Option<Arc<Endpoint>>,
    keepalive: Option<Keepalive>,
}

impl ControlSession {
    async fn run<R>(&mut self, mut read_half: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut codec = FrameCodec::new();
        let mut read_buf = BytesMut::with_capacity(READ_BUF_SIZE);

        loop {
            if read_buf.capacity() - read_buf.len() < 1024 {
                read_buf.reserve(READ_BUF_SIZE);
            }
            let next_ping = self.keepalive.as_ref().map(Keepalive::next_ping);
            let pong_deadline = self.keepalive.as_ref().and_then(Keepalive::pong_deadline);

            let event = tokio::select! {
                _ = self.conn.kill.cancelled() => Event::Killed,
                res = read_half.read_buf(&mut read_buf) => Event::Read(res),
                _ = sleep_until_opt(next_ping) => Event::PingDue,
                _ = sleep_until_opt(pong_deadline) => Event::PongOverdue,
            };

            match event {
                Event::Killed => {
                    tracing::debug!("Control connection {} destroyed", self.conn.id);
                    return;
                }
                Event::Read(Ok(0)) => {
                    tracing::debug!("Client {} disconnected", self.conn.remote);
                    return;
                }
                Event::Read(Err(e)) => {
                    tracing::debug!("Read error from {}: {}", self.conn.remote, e);
                    return;
                }
                Event::Read(Ok(_)) => loop {
                    match codec.decode(&mut read_buf) {
                        Ok(Some(frame)) => {
                            if let Flow::Close = self.handle_frame(frame).await {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("Protocol violation from {}: {}", self.conn.remote, e);
                            return;
                        }
                    }
                },
                Event::PingDue => {
                    if !self.send(Message::Ping).await {
                        return;
                    }
                    if let Some(keepalive) = self.keepalive.as_mut() {
                        keepalive.ping_sent();
                    }
                }
                Event::PongOverdue => {
                    let status = self.keepalive.as_mut().map(Keepalive::pong_overdue);
                    if status == Some(PeerStatus::Dead) {
                        tracing::info!("Client timed out: {}", self.label());
                        return;
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Flow {
        let msg = match Message::from_frame(frame) {
            Ok(msg) => msg,
            Err(MessageError::UnknownType(t)) if self.state == ConnectionState::New => {
                tracing::warn!("Message type {} from {} before HELLO", t, self.conn.remote);
                self.end_with_error(STATE_VIOLATION).await;
                return Flow::Close;
            }
            Err(MessageError::UnknownType(t)) => {
                tracing::debug!("Ignoring unknown message type {}", t);
                return Flow::Continue;
            }
            Err(
                e @ MessageError::InvalidPayload {
                    msg_type: MessageType::HelloReq,
                    ..
                },
            ) => {
                return self.reject_hello(HelloError::Malformed(e.to_string())).await;
            }
            Err(e) => {
                tracing::warn!("Invalid message from {}: {}", self.conn.remote, e);
                self.end_with_error("Invalid message payload").await;
                return Flow::Close;
            }
        };

        if self.state != ConnectionState::Active && !matches!(msg, Message::HelloReq(_)) {
            tracing::warn!(
                "{} from {} before HELLO completed",
                msg.message_type(),
                self.conn.remote
            );
            self.end_with_error(STATE_VIOLATION).await;
            return Flow::Close;
        }

        match msg {
            Message::HelloReq(hello) => {
                if self.state != ConnectionState::New {
                    return self.reject_hello(HelloError::InvalidState).await;
                }
                match self.dispatcher.hello(&self.conn, hello).await {
                    Ok(endpoint) => {
                        tracing::info!("Client connected: {}@{}", endpoint.name, self.conn.user());
                        self.state = ConnectionState::Active;
                        self.endpoint = Some(endpoint);
                        self.keepalive = Some(Keepalive::new(self.dispatcher.config.keepalive));
                        Flow::Continue
                    }
                    Err(e) => self.reject_hello(e).await,
                }
            }
            Message::ClientData { channel, data } => {
                if self.forward_to_visitor(channel, data).await {
                    Flow::Continue
                } else {
                    Flow::Close
                }
            }
            Message::ClientClose(ChannelClose { channel_id }) => {
                if let Some(endpoint) = &self.endpoint {
                    // Dropping the queue lets the visitor writer flush and close
                    if endpoint.channels.remove(&channel_id).is_some() {
                        tracing::debug!("Channel {} closed by client", channel_id);
                    }
                }
                Flow::Continue
            }
            Message::End(end) => {
                self.state = ConnectionState::Ended;
                match end.error {
                    Some(error) => tracing::info!("Client {} ended: {}", self.label(), error),
                    None => tracing::debug!("Client {} ended", self.label()),
                }
                Flow::Close
            }
            Message::Ping => {
                if self.send(Message::Pong).await {
                    Flow::Continue
                } else {
                    Flow::Close
                }
            }
            Message::Pong => {
                if let Some(keepalive) = self.keepalive.as_mut() {
                    keepalive.pong_received();
                }
                Flow::Continue
            }
            other => {
                tracing::debug!("Ignoring {} from client", other.message_type());
                Flow::Continue
            }
        }
    }

    /// Hand client data to its visitor without waiting on the visitor socket
    ///
    /// Unknown channels are a close race, not an error. A visitor whose buffer
    /// is full is dropped and the client gets SERVER_CLOSE. Returns false once
    /// the control connection is going away.
    async fn forward_to_visitor(&self, channel: u32, data: Bytes) -> bool {
        let Some(endpoint) = &self.endpoint else {
            return true;
        };
        let len = data.len() as u64;
        let pushed = match endpoint.channels.get(&channel) {
            Some(ts) => {
                ts.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
                ts.writer.try_send(data)
            }
            None => {
                tracing::trace!("CLIENT_DATA for unknown channel {}", channel);
                return true;
            }
        };
        self.conn.bytes_sent.fetch_add(len, Ordering::Relaxed);

        match pushed {
            // A closed queue means the channel task is finishing and reports it
            Ok(()) | Err(QueueError::Closed) => true,
            Err(QueueError::Full) => {
                if let Some((_, ts)) = endpoint.channels.remove(&channel) {
                    tracing::warn!(
                        "Channel {} dropped, visitor {} stopped reading ({} bytes buffered)",
                        channel,
                        ts.remote,
                        ts.writer.queued()
                    );
                    ts.kill.cancel();
                }
                self.send(Message::ServerClose(ChannelClose {
                    channel_id: channel,
                }))
                .await
            }
        }
    }

    async fn reject_hello(&self, error: HelloError) -> Flow {
        tracing::info!("HELLO from {} rejected: {}", self.conn.remote, error);
        let _ = self
            .send(Message::HelloResp(HelloResponse::rejected(error.to_string())))
            .await;
        Flow::Close
    }

    async fn end_with_error(&self, error: &str) {
        let _ = self.send(Message::end(Some(error.to_string()))).await;
    }

    /// Queue a message; false once the connection is going away
    async fn send(&self, msg: Message) -> bool {
        tokio::select! {
            _ = self.conn.kill.cancelled() => false,
            res = self.conn.sender.send(msg) => res.is_ok(),
        }
    }

    fn label(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("{}@{}", endpoint.name, self.conn.user()),
            None => self.conn.remote.to_string(),
        }
    }
}
