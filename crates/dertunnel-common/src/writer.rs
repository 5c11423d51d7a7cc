use std::time::Duration;

use bytes::BytesMut;
use dertunnel_protocol::{FrameCodec, Message};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;

/// Queue depth of a control connection's write path
pub const WRITE_QUEUE_DEPTH: usize = 32;

/// Stop batching queued messages into one write past this size
const MAX_BATCH_BYTES: usize = 64 * 1024;

/// Handle to a spawned frame writer task
pub struct FrameWriter {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Spawn the task that owns the write half of a control connection
///
/// Messages sent through the returned queue are written in order. The queue is
/// bounded, so a slow peer makes senders wait. Cancelling `kill` stops the
/// task without flushing.
pub fn spawn_frame_writer<W>(
    write_half: W,
    kill: CancellationToken,
) -> (mpsc::Sender<Message>, FrameWriter)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(write_loop(write_half, rx, shutdown.clone(), kill));
    (tx, FrameWriter { shutdown, task })
}

impl FrameWriter {
    /// Flush what is already queued, then shut the stream down
    ///
    /// Gives up and aborts the task after `grace`.
    pub async fn close(mut self, grace: Duration) {
        self.shutdown.cancel();
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            tracing::debug!("Writer did not drain within {:?}", grace);
            self.task.abort();
        }
    }
}

async fn write_loop<W>(
    mut write_half: W,
    mut rx: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
    kill: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::with_capacity(8192);
    let mut draining = false;

    loop {
        let msg = tokio::select! {
            biased;
            _ = kill.cancelled() => return,
            _ = shutdown.cancelled(), if !draining => {
                // Stop accepting, keep what is buffered
                rx.close();
                draining = true;
                continue;
            }
            msg = rx.recv() => msg,
        };
        let Some(msg) = msg else { break };

        buf.clear();
        if let Err(e) = codec.encode(msg, &mut buf) {
            tracing::error!("Failed to encode message: {}", e);
            break;
        }
        while buf.len() < MAX_BATCH_BYTES {
            let Ok(next) = rx.try_recv() else { break };
            if let Err(e) = codec.encode(next, &mut buf) {
                tracing::error!("Failed to encode message: {}", e);
                break;
            }
        }

        let written = tokio::select! {
            _ = kill.cancelled() => return,
            res = async {
                write_half.write_all(&buf).await?;
                write_half.flush().await
            } => res,
        };
        if let Err(e) = written {
            tracing::debug!("Failed to write message: {}", e);
            return;
        }
    }

    // Send TLS close_notify for graceful shutdown
    if let Err(e) = write_half.shutdown().await {
        tracing::debug!("Shutdown: {}", e);
    }
}
