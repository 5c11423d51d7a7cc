use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dertunnel_common::ByteSender;
use dertunnel_protocol::Message;

/// First channel id handed out by the dispatcher
pub const FIRST_CHANNEL_ID: u32 = 10000;

/// Channel id counter shared by all endpoints
pub struct ChannelIdGenerator {
    counter: AtomicU32,
}

impl ChannelIdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(FIRST_CHANNEL_ID),
        }
    }

    pub fn next(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ChannelIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared side of one tunnel client control connection
///
/// The connection task owns the protocol state; everything here may be
/// touched by channel tasks and snapshot readers.
pub struct ClientConnection {
    pub id: u64,
    pub remote: SocketAddr,
    user: OnceLock<String>,
    /// Queue into the control connection's writer task
    pub sender: mpsc::Sender<Message>,
    /// Cancelled when the connection is destroyed; channels hold child tokens
    pub kill: CancellationToken,
    /// Bytes forwarded from the client to visitors
    pub bytes_sent: AtomicU64,
    /// Bytes forwarded from visitors to the client
    pub bytes_received: AtomicU64,
}

impl ClientConnection {
    pub fn new(
        id: u64,
        remote: SocketAddr,
        sender: mpsc::Sender<Message>,
        kill: CancellationToken,
    ) -> Self {
        Self {
            id,
            remote,
            user: OnceLock::new(),
            sender,
            kill,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Authenticated user, empty before HELLO
    pub fn user(&self) -> &str {
        self.user.get().map(String::as_str).unwrap_or_default()
    }

    pub(crate) fn set_user(&self, user: String) {
        let _ = self.user.set(user);
    }

    pub fn destroy(&self) {
        self.kill.cancel();
    }
}

/// Byte counters of one forwarded visitor connection
#[derive(Debug, Default)]
pub struct ChannelCounters {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

/// A visitor connection as seen by its endpoint
pub struct TaggedSocket {
    pub channel_id: u32,
    pub remote: SocketAddr,
    /// Data queued for the visitor; dropping it ends the channel gracefully
    pub writer: ByteSender,
    /// Cancelling drops the visitor without flushing
    pub kill: CancellationToken,
    pub counters: Arc<ChannelCounters>,
}

/// A public name bound to one client connection
pub struct Endpoint {
    pub name: String,
    pub owner: Arc<ClientConnection>,
    pub channels: DashMap<u32, TaggedSocket>,
}

impl Endpoint {
    pub fn new(name: String, owner: Arc<ClientConnection>) -> Self {
        Self {
            name,
            owner,
            channels: DashMap::new(),
        }
    }

    pub fn info(&self) -> EndpointInfo {
        EndpointInfo {
            name: self.name.clone(),
            user: self.owner.user().to_string(),
            active_connections: self.channels.len(),
            bytes_sent: self.owner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.owner.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointInfo {
    pub name: String,
    pub user: String,
    pub active_connections: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Snapshot of one endpoint, grouped under its user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSummary {
    pub name: String,
    pub active_connections: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Snapshot of all endpoints of one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub endpoints: Vec<EndpointSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_ids_start_at_10000() {
        let ids = ChannelIdGenerator::new();
        assert_eq!(ids.next(), 10000);
        assert_eq!(ids.next(), 10001);
    }

    #[test]
    fn test_channel_ids_unique_across_threads() {
        let ids = Arc::new(ChannelIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..1000).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }
}
