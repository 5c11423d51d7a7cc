use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

/// Default byte budget of one forwarded socket
pub const DEFAULT_SOCKET_BUFFER: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Socket buffer full")]
    Full,
    #[error("Socket already closed")]
    Closed,
}

/// Producer side of a byte-budgeted socket queue
///
/// Pushing never waits: a control connection loop hands data over and moves on.
/// Data holds its share of the budget until the consumer drops it.
pub struct ByteSender {
    tx: mpsc::UnboundedSender<QueuedBytes>,
    budget: Arc<Semaphore>,
    limit: u32,
}

pub struct ByteReceiver {
    rx: mpsc::UnboundedReceiver<QueuedBytes>,
}

/// Queued data; dropping it returns its bytes to the budget
pub struct QueuedBytes {
    pub data: Bytes,
    _permit: OwnedSemaphorePermit,
}

pub fn byte_queue(limit: usize) -> (ByteSender, ByteReceiver) {
    let max = u32::try_from(Semaphore::MAX_PERMITS).unwrap_or(u32::MAX);
    let limit = u32::try_from(limit).unwrap_or(max).clamp(1, max);
    let (tx, rx) = mpsc::unbounded_channel();
    let budget = Arc::new(Semaphore::new(limit as usize));
    (ByteSender { tx, budget, limit }, ByteReceiver { rx })
}

impl ByteSender {
    pub fn try_send(&self, data: Bytes) -> Result<(), QueueError> {
        if self.tx.is_closed() {
            return Err(QueueError::Closed);
        }
        // A chunk larger than the whole budget needs an empty queue
        let cost = u32::try_from(data.len()).unwrap_or(u32::MAX).clamp(1, self.limit);
        let permit = self
            .budget
            .clone()
            .try_acquire_many_owned(cost)
            .map_err(|_| QueueError::Full)?;
        self.tx
            .send(QueuedBytes {
                data,
                _permit: permit,
            })
            .map_err(|_| QueueError::Closed)
    }

    /// Bytes currently queued, as charged against the budget
    pub fn queued(&self) -> usize {
        self.limit as usize - self.budget.available_permits()
    }
}

impl ByteReceiver {
    pub async fn recv(&mut self) -> Option<QueuedBytes> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_budget_is_returned_after_consume() {
        let (tx, mut rx) = byte_queue(10);
        tx.try_send(Bytes::from_static(b"123456")).unwrap();
        assert_eq!(
            tx.try_send(Bytes::from_static(b"12345")),
            Err(QueueError::Full)
        );
        assert_eq!(tx.queued(), 6);

        // Held until the consumer is done with it
        let item = rx.recv().await.unwrap();
        assert_eq!(item.data, Bytes::from_static(b"123456"));
        assert_eq!(
            tx.try_send(Bytes::from_static(b"12345")),
            Err(QueueError::Full)
        );
        drop(item);
        tx.try_send(Bytes::from_static(b"12345")).unwrap();
    }

    #[tokio::test]
    async fn test_oversized_chunk_needs_empty_queue() {
        let (tx, mut rx) = byte_queue(4);
        tx.try_send(Bytes::from_static(b"much larger than four")).unwrap();
        assert_eq!(tx.try_send(Bytes::from_static(b"x")), Err(QueueError::Full));
        drop(rx.recv().await);
        tx.try_send(Bytes::from_static(b"x")).unwrap();
    }

    #[tokio::test]
    async fn test_closed_receiver() {
        let (tx, rx) = byte_queue(16);
        drop(rx);
        assert_eq!(tx.try_send(Bytes::from_static(b"x")), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_dropped_sender_ends_receiver() {
        let (tx, mut rx) = byte_queue(16);
        tx.try_send(Bytes::from_static(b"last")).unwrap();
        drop(tx);
        assert_eq!(rx.recv().await.unwrap().data, Bytes::from_static(b"last"));
        assert!(rx.recv().await.is_none());
    }
}
