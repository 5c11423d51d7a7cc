use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use dertunnel_common::{sleep_until_opt, spawn_frame_writer, Deferred, Keepalive, PeerStatus};
use dertunnel_protocol::{
    ChannelClose, Frame, FrameCodec, HelloRequest, HelloResponse, Message, MessageError,
    ServerOpen, PROTOCOL_VERSION,
};

use crate::error::ClientError;
use crate::local::{ChannelContext, LocalChannel};
use crate::observer::TunnelObserver;
use crate::options::ClientOptions;
use crate::reconnect::ReconnectTimer;
use crate::stats::StatsTracker;
use crate::transport::Transport;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Time allowed for flushing the control connection on close
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of the control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
}

/// Handle of a running tunnel
///
/// Dropping the handle does not stop the tunnel; call [`TunnelHandle::shutdown`].
pub struct TunnelHandle {
    endpoint: Option<String>,
    shutdown: CancellationToken,
    state: watch::Receiver<ConnectionState>,
    stats: Arc<StatsTracker>,
    task: JoinHandle<()>,
}

impl TunnelHandle {
    /// Public host name assigned by the first successful HELLO
    ///
    /// Only known when `connect_tunnel` waited for the initial connection.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Resolves once the connection state satisfies `f`
    pub async fn wait_for_state(&self, f: impl Fn(ConnectionState) -> bool) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| f(*s)).await;
    }

    pub fn stats(&self) -> crate::observer::ClientStats {
        self.stats.snapshot()
    }

    /// Stop the tunnel and cancel all reconnects; idempotent
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Shut down and wait for the engine to stop
    pub async fn close(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

/// Start the tunnel engine
///
/// With `wait_for_initial_connection` set, this returns after the first HELLO
/// outcome; a failed first attempt stops the engine and becomes the error.
pub async fn connect_tunnel<T: Transport>(
    options: ClientOptions,
    transport: T,
    observer: Arc<dyn TunnelObserver>,
) -> Result<TunnelHandle, ClientError> {
    options.validate()?;

    let shutdown = CancellationToken::new();
    let connected = Deferred::new();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let stats = Arc::new(StatsTracker::new(observer.clone()));
    let wait = options.wait_for_initial_connection;

    let engine = Engine {
        options: Arc::new(options),
        transport,
        observer,
        stats: stats.clone(),
        connected: connected.clone(),
        shutdown: shutdown.clone(),
        state: state_tx,
    };
    let task = tokio::spawn(engine.run());

    let endpoint = if wait {
        match connected.wait().await {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                shutdown.cancel();
                let _ = task.await;
                return Err(ClientError::Connection(e));
            }
        }
    } else {
        None
    };

    Ok(TunnelHandle {
        endpoint,
        shutdown,
        state: state_rx,
        stats,
        task,
    })
}

struct Engine<T: Transport> {
    options: Arc<ClientOptions>,
    transport: T,
    observer: Arc<dyn TunnelObserver>,
    stats: Arc<StatsTracker>,
    /// Settled by the first HELLO outcome
    connected: Deferred<String>,
    shutdown: CancellationToken,
    state: watch::Sender<ConnectionState>,
}

impl<T: Transport> Engine<T> {
    async fn run(self) {
        let mut reconnect = ReconnectTimer::new();
        let service = self.options.service_host();
        tracing::info!(
            "Connecting to {}:{} to expose {}",
            service,
            self.options.service_port,
            self.options.local
        );

        while !self.shutdown.is_cancelled() {
            self.state.send_replace(ConnectionState::Connecting);
            let connect = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = self.transport.connect() => res,
            };

            match connect {
                Ok(stream) => {
                    self.state.send_replace(ConnectionState::Authenticating);
                    let session = Session::new(&self, &mut reconnect);
                    session.run(stream).await;
                }
                Err(e) => {
                    let error = format!("Server connection error: {}", e);
                    self.connected.reject(error.clone());
                    self.observer.on_error(&error);
                }
            }
            self.state.send_replace(ConnectionState::Disconnected);

            if self.shutdown.is_cancelled() {
                break;
            }
            let delay = reconnect.next_delay();
            tracing::debug!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        tracing::info!("Tunnel shut down");
    }
}

enum Flow {
    Continue,
    Close,
}

enum Event {
    Killed,
    Read(std::io::Result<usize>),
    LocalClosed(u32),
    PingDue,
    PongOverdue,
}

/// One control connection, from HELLO to close
struct Session<'a, T: Transport> {
    engine: &'a Engine<T>,
    reconnect: &'a mut ReconnectTimer,
    authenticated: bool,
    channels: HashMap<u32, LocalChannel>,
    keepalive: Option<Keepalive>,
}

impl<'a, T: Transport> Session<'a, T> {
    fn new(engine: &'a Engine<T>, reconnect: &'a mut ReconnectTimer) -> Self {
        Self {
            engine,
            reconnect,
            authenticated: false,
            channels: HashMap::new(),
            keepalive: None,
        }
    }

    async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, write_half) = tokio::io::split(stream);
        let kill = self.engine.shutdown.child_token();
        let (sender, writer) = spawn_frame_writer(write_half, kill.clone());
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let ctx = ChannelContext {
            target: self.engine.options.local.clone(),
            sender,
            kill: kill.clone(),
            stats: self.engine.stats.clone(),
            observer: self.engine.observer.clone(),
            closed: closed_tx,
            inspect: self.engine.options.inspect,
            local_buffer: self.engine.options.local_buffer,
        };

        let options = &self.engine.options;
        let hello = HelloRequest {
            version: PROTOCOL_VERSION,
            user: options.user.clone(),
            token: options.token.clone(),
            endpoint: options.endpoint.clone().filter(|e| !e.is_empty()),
            endpoint_prefix: options.endpoint_prefix.clone().filter(|p| !p.is_empty()),
        };

        if send(&ctx, Message::HelloReq(hello)).await {
            self.read_loop(&mut read_half, &mut closed_rx, &ctx).await;
        }

        // Teardown: channels die with `kill`, the writer gets a short flush
        if !self.authenticated {
            self.engine
                .connected
                .reject("Server closed the connection before authentication");
        }
        self.channels.clear();
        writer.close(CLOSE_GRACE).await;
        kill.cancel();
        tracing::debug!("Control connection closed");
    }

    async fn read_loop<R>(
        &mut self,
        read_half: &mut R,
        closed_rx: &mut mpsc::UnboundedReceiver<u32>,
        ctx: &ChannelContext,
    ) where
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
                _ = ctx.kill.cancelled() => Event::Killed,
                res = read_half.read_buf(&mut read_buf) => Event::Read(res),
                Some(id) = closed_rx.recv() => Event::LocalClosed(id),
                _ = sleep_until_opt(next_ping) => Event::PingDue,
                _ = sleep_until_opt(pong_deadline) => Event::PongOverdue,
            };

            match event {
                Event::Killed => return,
                Event::Read(Ok(0)) => {
                    tracing::info!("Server closed the connection");
                    return;
                }
                Event::Read(Err(e)) => {
                    let error = format!("Server connection error: {}", e);
                    self.engine.connected.reject(error.clone());
                    self.engine.observer.on_error(&error);
                    return;
                }
                Event::Read(Ok(_)) => loop {
                    match codec.decode(&mut read_buf) {
                        Ok(Some(frame)) => {
                            if let Flow::Close = self.handle_frame(frame, ctx).await {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("Protocol violation from server: {}", e);
                            return;
                        }
                    }
                },
                Event::LocalClosed(id) => {
                    self.channels.remove(&id);
                }
                Event::PingDue => {
                    if !send(ctx, Message::Ping).await {
                        return;
                    }
                    if let Some(keepalive) = self.keepalive.as_mut() {
                        keepalive.ping_sent();
                    }
                }
                Event::PongOverdue => {
                    let status = self.keepalive.as_mut().map(Keepalive::pong_overdue);
                    if status == Some(PeerStatus::Dead) {
                        self.engine.observer.on_error("Server timed out");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame, ctx: &ChannelContext) -> Flow {
        let msg = match Message::from_frame(frame) {
            Ok(msg) => msg,
            Err(MessageError::UnknownType(t)) => {
                tracing::debug!("Ignoring unknown message type {}", t);
                return Flow::Continue;
            }
            Err(e) => {
                tracing::warn!("Invalid message from server: {}", e);
                return Flow::Close;
            }
        };

        match msg {
            Message::HelloResp(resp) if !self.authenticated => self.on_hello_response(resp),
            Message::End(end) => {
                if let Some(error) = end.error {
                    self.engine.observer.on_error(&error);
                }
                Flow::Close
            }
            _ if !self.authenticated => {
                tracing::debug!("Ignoring {} before HELLO_RESP", msg.message_type());
                Flow::Continue
            }
            Message::Ping => {
                if send(ctx, Message::Pong).await {
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
            Message::ServerOpen(ServerOpen { channel_id, client }) => {
                tracing::debug!("Channel {} opened for {}", channel_id, client);
                let channel = LocalChannel::open(channel_id, ctx.clone());
                self.channels.insert(channel_id, channel);
                Flow::Continue
            }
            Message::ServerData { channel, data } => {
                let dropped = self
                    .channels
                    .get_mut(&channel)
                    .is_some_and(|local| !local.write(data, ctx));
                if dropped {
                    // Its task sends CLIENT_CLOSE; later data for it is stale
                    self.channels.remove(&channel);
                }
                Flow::Continue
            }
            Message::ServerClose(ChannelClose { channel_id }) => {
                // Dropping the queue lets the local writer flush and close
                if let Some(local) = self.channels.remove(&channel_id) {
                    tracing::debug!(
                        "Channel {} closed by server after {} bytes",
                        channel_id,
                        local
                            .counters()
                            .bytes_sent
                            .load(std::sync::atomic::Ordering::Relaxed)
                    );
                }
                Flow::Continue
            }
            other => {
                tracing::debug!("Ignoring {} from server", other.message_type());
                Flow::Continue
            }
        }
    }

    fn on_hello_response(&mut self, resp: HelloResponse) -> Flow {
        match resp {
            HelloResponse::Accepted { endpoint, .. } => {
                let endpoint = endpoint.unwrap_or_default();
                self.authenticated = true;
                self.reconnect.reset();
                self.keepalive = Some(Keepalive::new(self.engine.options.keepalive));
                self.engine.state.send_replace(ConnectionState::Connected);
                self.engine.observer.on_connected(&endpoint);
                self.engine.stats.flush();
                self.engine.connected.resolve(endpoint);
                Flow::Continue
            }
            HelloResponse::Rejected { error } => {
                let error = format!(
                    "Server connection error: {}",
                    error.as_deref().unwrap_or("Unknown error")
                );
                self.engine.connected.reject(error.clone());
                self.engine.observer.on_error(&error);
                Flow::Close
            }
        }
    }
}

/// Queue a message; false once the connection is going away
async fn send(ctx: &ChannelContext, msg: Message) -> bool {
    tokio::select! {
        _ = ctx.kill.cancelled() => false,
        res = ctx.sender.send(msg) => res.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::net::TcpListener;
    use tokio::time::Instant;
    use tokio_util::codec::Encoder;

    use crate::options::LocalTarget;

    #[derive(Clone)]
    struct TestTransport {
        accepted: mpsc::UnboundedSender<DuplexStream>,
        refuse: Arc<AtomicBool>,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for TestTransport {
        type Stream = DuplexStream;

        async fn connect(&self) -> io::Result<DuplexStream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            let (client, server) = tokio::io::duplex(256 * 1024);
            let _ = self.accepted.send(server);
            Ok(client)
        }
    }

    #[derive(Default)]
    struct Recorder {
        connected: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
    }

    impl TunnelObserver for Recorder {
        fn on_connected(&self, endpoint: &str) {
            self.connected.lock().push(endpoint.to_string());
        }

        fn on_error(&self, error: &str) {
            self.errors.lock().push(error.to_string());
        }
    }

    struct Harness {
        transport: TestTransport,
        incoming: mpsc::UnboundedReceiver<DuplexStream>,
        recorder: Arc<Recorder>,
    }

    impl Harness {
        fn new() -> Self {
            let (accepted, incoming) = mpsc::unbounded_channel();
            Self {
                transport: TestTransport {
                    accepted,
                    refuse: Arc::new(AtomicBool::new(false)),
                    attempts: Arc::new(AtomicUsize::new(0)),
                },
                incoming,
                recorder: Arc::new(Recorder::default()),
            }
        }

        fn connect(
            &self,
            options: ClientOptions,
        ) -> JoinHandle<Result<TunnelHandle, ClientError>> {
            tokio::spawn(connect_tunnel(
                options,
                self.transport.clone(),
                self.recorder.clone(),
            ))
        }

        async fn accept(&mut self) -> FakeServer {
            let stream = tokio::time::timeout(Duration::from_secs(60), self.incoming.recv())
                .await
                .expect("timed out waiting for a connection")
                .expect("transport dropped");
            FakeServer::new(stream)
        }

        fn attempts(&self) -> usize {
            self.transport.attempts.load(Ordering::SeqCst)
        }
    }

    struct FakeServer {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        codec: FrameCodec,
        buf: BytesMut,
    }

    impl FakeServer {
        fn new(stream: DuplexStream) -> Self {
            let (reader, writer) = tokio::io::split(stream);
            Self {
                reader,
                writer,
                codec: FrameCodec::new(),
                buf: BytesMut::new(),
            }
        }

        async fn send(&mut self, msg: Message) {
            let mut out = BytesMut::new();
            self.codec.encode(msg, &mut out).unwrap();
            self.writer.write_all(&out).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Message> {
            tokio::time::timeout(Duration::from_secs(60), async {
                loop {
                    if let Some(frame) = self.codec.decode(&mut self.buf).unwrap() {
                        return Some(Message::from_frame(frame).unwrap());
                    }
                    match self.reader.read_buf(&mut self.buf).await {
                        Ok(0) | Err(_) => return None,
                        Ok(_) => {}
                    }
                }
            })
            .await
            .expect("timed out waiting for client")
        }

        async fn hello(&mut self) -> HelloRequest {
            match self.recv().await {
                Some(Message::HelloReq(hello)) => hello,
                other => panic!("Expected HELLO_REQ, got {:?}", other),
            }
        }

        async fn accept_hello(&mut self, endpoint: &str) {
            self.hello().await;
            self.send(Message::HelloResp(HelloResponse::accepted(
                endpoint,
                "DerTunnel",
            )))
            .await;
        }
    }

    fn options(port: u16) -> ClientOptions {
        ClientOptions::new(
            "alice",
            "secret",
            "tunnel.test",
            LocalTarget::new("127.0.0.1", port),
        )
        .with_endpoint("app")
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }

    #[tokio::test]
    async fn test_hello_and_accept() {
        let mut harness = Harness::new();
        let connecting = harness.connect(options(3000));

        let mut server = harness.accept().await;
        let hello = server.hello().await;
        assert_eq!(hello.version, PROTOCOL_VERSION);
        assert_eq!(hello.user, "alice");
        assert_eq!(hello.token, "secret");
        assert_eq!(hello.endpoint.as_deref(), Some("app"));
        assert_eq!(hello.endpoint_prefix, None);

        server
            .send(Message::HelloResp(HelloResponse::accepted(
                "app.tunnel.test",
                "DerTunnel",
            )))
            .await;
        let handle = connecting.await.unwrap().unwrap();
        assert_eq!(handle.endpoint(), Some("app.tunnel.test"));
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(*harness.recorder.connected.lock(), vec!["app.tunnel.test"]);

        server.send(Message::Ping).await;
        assert_eq!(server.recv().await, Some(Message::Pong));
        handle.close().await;
    }

    #[tokio::test]
    async fn test_rejected_hello_fails_initial_connection() {
        let mut harness = Harness::new();
        let connecting = harness.connect(options(3000));

        let mut server = harness.accept().await;
        server.hello().await;
        server
            .send(Message::HelloResp(HelloResponse::rejected(
                "Invalid username or token",
            )))
            .await;

        let err = connecting.await.unwrap().err().unwrap();
        assert_eq!(
            err.to_string(),
            "Server connection error: Invalid username or token"
        );
        assert_eq!(
            *harness.recorder.errors.lock(),
            vec!["Server connection error: Invalid username or token"]
        );
        assert_eq!(server.recv().await, None);
        assert_eq!(harness.attempts(), 1);
    }

    #[tokio::test]
    async fn test_refused_transport_fails_initial_connection() {
        let harness = Harness::new();
        harness.transport.refuse.store(true, Ordering::SeqCst);

        let err = harness.connect(options(3000)).await.unwrap().err().unwrap();
        assert!(matches!(err, ClientError::Connection(ref m) if m.contains("refused")));
        assert_eq!(harness.attempts(), 1);
    }

    #[tokio::test]
    async fn test_invalid_options_are_refused() {
        let harness = Harness::new();
        let mut opts = options(3000);
        opts.endpoint = None;
        let err = harness.connect(opts).await.unwrap().err().unwrap();
        assert!(matches!(err, ClientError::MissingEndpoint));
        assert_eq!(harness.attempts(), 0);
    }

    #[tokio::test]
    async fn test_channel_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut harness = Harness::new();
        let connecting = harness.connect(options(port));
        let mut server = harness.accept().await;
        server.accept_hello("app.tunnel.test").await;
        let handle = connecting.await.unwrap().unwrap();

        server
            .send(Message::ServerOpen(ServerOpen {
                channel_id: 10000,
                client: "203.0.113.7:51000".to_string(),
            }))
            .await;
        server
            .send(Message::ServerData {
                channel: 10000,
                data: Bytes::from_static(b"ping"),
            })
            .await;

        let (mut local, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 4];
        local.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"ping");

        local.write_all(b"pong").await.unwrap();
        assert_eq!(
            server.recv().await,
            Some(Message::ClientData {
                channel: 10000,
                data: Bytes::from_static(b"pong")
            })
        );

        // SERVER_CLOSE ends the local socket without a CLIENT_CLOSE echo
        server
            .send(Message::ServerClose(ChannelClose { channel_id: 10000 }))
            .await;
        let mut rest = Vec::new();
        local.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        eventually("disconnect", || handle.stats().current_connections == 0).await;
        let stats = handle.stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.bytes_sent, 4);
        assert_eq!(stats.bytes_received, 4);
        assert_eq!(stats.connection_errors, 0);

        server.send(Message::Ping).await;
        assert_eq!(server.recv().await, Some(Message::Pong));
        handle.close().await;
    }

    #[tokio::test]
    async fn test_local_close_sends_client_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut harness = Harness::new();
        let connecting = harness.connect(options(port));
        let mut server = harness.accept().await;
        server.accept_hello("app.tunnel.test").await;
        let handle = connecting.await.unwrap().unwrap();

        server
            .send(Message::ServerOpen(ServerOpen {
                channel_id: 10001,
                client: "203.0.113.7:51000".to_string(),
            }))
            .await;
        let (local, _) = listener.accept().await.unwrap();
        drop(local);

        assert_eq!(
            server.recv().await,
            Some(Message::ClientClose(ChannelClose { channel_id: 10001 }))
        );
        handle.close().await;
    }

    #[tokio::test]
    async fn test_stalled_local_service_is_dropped_without_blocking_control() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut harness = Harness::new();
        let mut opts = options(port);
        opts.local_buffer = 64 * 1024;
        let connecting = harness.connect(opts);
        let mut server = harness.accept().await;
        server.accept_hello("app.tunnel.test").await;
        let handle = connecting.await.unwrap().unwrap();

        server
            .send(Message::ServerOpen(ServerOpen {
                channel_id: 10003,
                client: "203.0.113.7:51000".to_string(),
            }))
            .await;
        // Accepted but never read; socket buffers absorb a few MiB first
        let (_local, _) = listener.accept().await.unwrap();

        let chunk = Bytes::from(vec![b'x'; 64 * 1024]);
        for _ in 0..400 {
            server
                .send(Message::ServerData {
                    channel: 10003,
                    data: chunk.clone(),
                })
                .await;
        }
        server.send(Message::Ping).await;

        let mut replies = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            while replies.len() < 2 {
                match server.recv().await {
                    Some(msg) => replies.push(msg),
                    None => break,
                }
            }
        })
        .await
        .expect("control connection stalled by a local service that stopped reading");
        assert!(replies.contains(&Message::Pong));
        assert!(replies.contains(&Message::ClientClose(ChannelClose { channel_id: 10003 })));

        eventually("disconnect", || handle.stats().current_connections == 0).await;
        assert_eq!(handle.stats().connection_errors, 1);
        handle.close().await;
    }

    #[tokio::test]
    async fn test_local_connect_failure() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut harness = Harness::new();
        let connecting = harness.connect(options(port));
        let mut server = harness.accept().await;
        server.accept_hello("app.tunnel.test").await;
        let handle = connecting.await.unwrap().unwrap();

        server
            .send(Message::ServerOpen(ServerOpen {
                channel_id: 10002,
                client: "203.0.113.7:51000".to_string(),
            }))
            .await;
        assert_eq!(
            server.recv().await,
            Some(Message::ClientClose(ChannelClose { channel_id: 10002 }))
        );

        let stats = handle.stats();
        assert_eq!(stats.connection_errors, 1);
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.current_connections, 0);
        handle.close().await;
    }

    #[tokio::test]
    async fn test_unknown_channel_data_is_dropped() {
        let mut harness = Harness::new();
        let connecting = harness.connect(options(3000));
        let mut server = harness.accept().await;
        server.accept_hello("app.tunnel.test").await;
        let handle = connecting.await.unwrap().unwrap();

        server
            .send(Message::ServerData {
                channel: 4242,
                data: Bytes::from_static(b"nobody"),
            })
            .await;
        server
            .send(Message::ServerClose(ChannelClose { channel_id: 4242 }))
            .await;
        server.send(Message::Ping).await;
        assert_eq!(server.recv().await, Some(Message::Pong));
        assert_eq!(handle.stats().bytes_sent, 0);
        handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_resets_after_hello() {
        let mut harness = Harness::new();
        let connecting = harness.connect(options(3000));

        let mut first = harness.accept().await;
        first.accept_hello("app.tunnel.test").await;
        let handle = connecting.await.unwrap().unwrap();
        drop(first);

        // Authenticated session: initial delay
        let closed_at = Instant::now();
        let mut second = harness.accept().await;
        assert!(closed_at.elapsed() >= Duration::from_millis(300));
        second.hello().await;
        drop(second);

        // Unauthenticated failure: backed off
        let closed_at = Instant::now();
        let mut third = harness.accept().await;
        assert!(closed_at.elapsed() >= Duration::from_millis(420));
        third.accept_hello("app.tunnel.test").await;
        handle
            .wait_for_state(|s| s == ConnectionState::Connected)
            .await;
        assert_eq!(harness.attempts(), 3);
        handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_reconnects() {
        let mut harness = Harness::new();
        let connecting = harness.connect(options(3000));
        let mut server = harness.accept().await;
        server.accept_hello("app.tunnel.test").await;
        let handle = connecting.await.unwrap().unwrap();

        handle.shutdown();
        handle.shutdown();
        assert_eq!(server.recv().await, None);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(harness.attempts(), 1);
        assert!(handle.is_finished());
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_pongs_drop_connection() {
        let mut harness = Harness::new();
        let connecting = harness.connect(options(3000));
        let mut server = harness.accept().await;
        server.accept_hello("app.tunnel.test").await;
        let handle = connecting.await.unwrap().unwrap();

        let started = Instant::now();
        assert_eq!(server.recv().await, Some(Message::Ping));
        assert_eq!(server.recv().await, Some(Message::Ping));
        assert_eq!(server.recv().await, None);
        assert!(started.elapsed() >= Duration::from_secs(37));
        assert!(harness
            .recorder
            .errors
            .lock()
            .contains(&"Server timed out".to_string()));

        // And the engine comes back
        let mut next = harness.accept().await;
        next.hello().await;
        handle.close().await;
    }

    #[tokio::test]
    async fn test_end_reports_error() {
        let mut harness = Harness::new();
        let connecting = harness.connect(options(3000));
        let mut server = harness.accept().await;
        server.accept_hello("app.tunnel.test").await;
        let handle = connecting.await.unwrap().unwrap();

        server
            .send(Message::end(Some("Endpoint removed".to_string())))
            .await;
        assert_eq!(server.recv().await, None);
        assert_eq!(
            *harness.recorder.errors.lock(),
            vec!["Endpoint removed"]
        );
        handle.close().await;
    }
}
