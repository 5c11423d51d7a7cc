use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dertunnel_common::{byte_queue, random_id, ByteReceiver, ByteSender, HttpInspector, QueueError};
use dertunnel_protocol::{ChannelClose, Message};

use crate::observer::TunnelObserver;
use crate::options::LocalTarget;
use crate::stats::StatsTracker;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Per-socket byte counters
#[derive(Debug, Default)]
pub struct LocalCounters {
    /// Written to the local service
    pub bytes_sent: AtomicU64,
    /// Read from the local service
    pub bytes_received: AtomicU64,
}

/// Session-side handle of one channel to the local service
pub struct LocalChannel {
    pub channel_id: u32,
    writer: ByteSender,
    /// Cancelled when the local socket cannot keep up
    overflow: CancellationToken,
    counters: Arc<LocalCounters>,
    requests: Option<HttpInspector>,
    connection_id: String,
}

/// Everything a channel task shares with its session
#[derive(Clone)]
pub struct ChannelContext {
    pub target: LocalTarget,
    /// Control connection write queue
    pub sender: mpsc::Sender<Message>,
    /// Cancelled with the control connection
    pub kill: CancellationToken,
    pub stats: Arc<StatsTracker>,
    pub observer: Arc<dyn TunnelObserver>,
    /// Channel ids whose local socket went away
    pub closed: mpsc::UnboundedSender<u32>,
    pub inspect: bool,
    /// Byte budget of each local socket queue
    pub local_buffer: usize,
}

impl LocalChannel {
    /// Spawn the task serving SERVER_OPEN for `channel_id`
    pub fn open(channel_id: u32, ctx: ChannelContext) -> Self {
        let (tx, rx) = byte_queue(ctx.local_buffer);
        let overflow = CancellationToken::new();
        let counters = Arc::new(LocalCounters::default());
        let connection_id = random_id(8);
        let (requests, responses) = if ctx.inspect {
            let (req, res) = HttpInspector::pair();
            (Some(req), Some(res))
        } else {
            (None, None)
        };

        tokio::spawn(run_channel(
            channel_id,
            ctx,
            rx,
            overflow.clone(),
            counters.clone(),
            responses,
            connection_id.clone(),
        ));

        Self {
            channel_id,
            writer: tx,
            overflow,
            counters,
            requests,
            connection_id,
        }
    }

    /// Queue SERVER_DATA for the local socket without waiting on it
    ///
    /// Returns false when the socket fell too far behind. The channel task then
    /// drops the socket and sends CLIENT_CLOSE.
    pub fn write(&mut self, data: Bytes, ctx: &ChannelContext) -> bool {
        ctx.stats.sent(data.len());
        self.counters
            .bytes_sent
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        if let Some(inspector) = self.requests.as_mut() {
            report_inspection(inspector.feed(&data), &self.connection_id, ctx);
        }

        match self.writer.try_send(data) {
            Ok(()) => true,
            Err(QueueError::Closed) => {
                tracing::trace!("Channel {} already closed locally", self.channel_id);
                true
            }
            Err(QueueError::Full) => {
                tracing::warn!(
                    "Channel {} dropped, local service stopped reading ({} bytes buffered)",
                    self.channel_id,
                    self.writer.queued()
                );
                ctx.stats
                    .connection_error(&format!("Local service {} stopped reading", ctx.target));
                self.overflow.cancel();
                false
            }
        }
    }

    pub fn counters(&self) -> &LocalCounters {
        &self.counters
    }
}

fn report_inspection(
    result: Result<Vec<dertunnel_common::ProtocolData>, dertunnel_common::InspectorError>,
    connection_id: &str,
    ctx: &ChannelContext,
) {
    match result {
        Ok(events) => {
            for event in &events {
                ctx.observer.on_protocol_data(connection_id, event);
            }
        }
        Err(e) => ctx.stats.error(&e.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// SERVER_CLOSE, the session dropped our queue
    Server,
    /// Local EOF or failure
    Local,
    /// Local socket stopped reading and was dropped
    Overflow,
    /// Control connection gone
    Killed,
}

async fn run_channel(
    channel_id: u32,
    ctx: ChannelContext,
    rx: ByteReceiver,
    overflow: CancellationToken,
    counters: Arc<LocalCounters>,
    mut responses: Option<HttpInspector>,
    connection_id: String,
) {
    let connect = tokio::select! {
        _ = ctx.kill.cancelled() => return,
        _ = overflow.cancelled() => {
            finish(channel_id, CloseReason::Overflow, &ctx).await;
            return;
        }
        res = TcpStream::connect(ctx.target.addr()) => res,
    };
    let stream = match connect {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("Channel {}: connect to {} failed: {}", channel_id, ctx.target, e);
            ctx.stats
                .connection_error(&format!("Connection to {} failed: {}", ctx.target, e));
            finish(channel_id, CloseReason::Local, &ctx).await;
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    ctx.stats.connected();
    tracing::debug!("Channel {} connected to {}", channel_id, ctx.target);

    let (mut read_half, write_half) = stream.into_split();
    let mut write_task = tokio::spawn(write_local(write_half, rx, ctx.kill.clone()));
    let mut writer_done = false;

    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
    let reason = loop {
        buf.reserve(READ_BUF_SIZE);
        let read = tokio::select! {
            _ = ctx.kill.cancelled() => break CloseReason::Killed,
            _ = overflow.cancelled() => break CloseReason::Overflow,
            res = &mut write_task => {
                writer_done = true;
                match res {
                    Ok(Ok(())) => break CloseReason::Server,
                    Ok(Err(e)) => {
                        ctx.stats.connection_error(&e.to_string());
                        break CloseReason::Local;
                    }
                    Err(_) => break CloseReason::Killed,
                }
            }
            res = read_half.read_buf(&mut buf) => res,
        };
        let n = match read {
            Ok(0) => break CloseReason::Local,
            Ok(n) => n,
            Err(e) => {
                ctx.stats.connection_error(&e.to_string());
                break CloseReason::Local;
            }
        };

        counters
            .bytes_received
            .fetch_add(n as u64, Ordering::Relaxed);
        ctx.stats.received(n);
        let data = buf.split().freeze();
        if let Some(inspector) = responses.as_mut() {
            report_inspection(inspector.feed(&data), &connection_id, &ctx);
        }

        // Not reading again until the control connection has room
        let forwarded = tokio::select! {
            _ = ctx.kill.cancelled() => break CloseReason::Killed,
            res = ctx.sender.send(Message::ClientData { channel: channel_id, data }) => res,
        };
        if forwarded.is_err() {
            break CloseReason::Killed;
        }
    };

    if !writer_done {
        write_task.abort();
    }
    tracing::debug!(
        "Channel {} closed ({:?}), {} bytes in, {} bytes out",
        channel_id,
        reason,
        counters.bytes_received.load(Ordering::Relaxed),
        counters.bytes_sent.load(Ordering::Relaxed)
    );
    ctx.stats.disconnected();
    finish(channel_id, reason, &ctx).await;
}

/// Tell the session, and the server unless it closed the channel itself
async fn finish(channel_id: u32, reason: CloseReason, ctx: &ChannelContext) {
    let _ = ctx.closed.send(channel_id);
    if matches!(reason, CloseReason::Local | CloseReason::Overflow) {
        let close = Message::ClientClose(ChannelClose { channel_id });
        tokio::select! {
            _ = ctx.kill.cancelled() => {}
            _ = ctx.sender.send(close) => {}
        }
    }
}

async fn write_local(
    mut write_half: OwnedWriteHalf,
    mut rx: ByteReceiver,
    kill: CancellationToken,
) -> io::Result<()> {
    loop {
        let queued = tokio::select! {
            biased;
            _ = kill.cancelled() => return Ok(()),
            queued = rx.recv() => queued,
        };
        let Some(queued) = queued else { break };
        write_half.write_all(&queued.data).await?;
    }
    // Queue dropped by SERVER_CLOSE: flush and close our side
    write_half.shutdown().await
}
