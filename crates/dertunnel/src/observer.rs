use serde::Serialize;

use dertunnel_common::{ProtocolData, ProtocolDataKind};

/// Aggregate counters over all local channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub current_connections: u64,
    pub total_connections: u64,
    pub connection_errors: u64,
    /// Chunks read from the local service
    pub chunks_received: u64,
    /// Chunks written to the local service
    pub chunks_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointEvent {
    Connect,
    Disconnect,
    Data,
    Error,
}

/// Callbacks of a running tunnel; all methods default to doing nothing
///
/// Callbacks run on the engine's tasks and must not block.
pub trait TunnelObserver: Send + Sync {
    /// HELLO accepted, `endpoint` is the public host name
    fn on_connected(&self, _endpoint: &str) {}

    fn on_error(&self, _error: &str) {}

    fn on_endpoint(&self, _event: EndpointEvent, _stats: &ClientStats, _message: &str) {}

    /// Inspected HTTP traffic; `connection_id` groups events of one channel
    fn on_protocol_data(&self, _connection_id: &str, _data: &ProtocolData) {}
}

/// Observer that writes everything to the log
#[derive(Debug, Default)]
pub struct LogObserver;

impl TunnelObserver for LogObserver {
    fn on_connected(&self, endpoint: &str) {
        tracing::info!("Connected - public endpoint: {}", endpoint);
    }

    fn on_error(&self, error: &str) {
        tracing::error!("{}", error);
    }

    fn on_endpoint(&self, event: EndpointEvent, stats: &ClientStats, message: &str) {
        match event {
            EndpointEvent::Error => tracing::warn!("{}", message),
            EndpointEvent::Connect | EndpointEvent::Disconnect => tracing::debug!(
                "Connections: {} active, {} total",
                stats.current_connections,
                stats.total_connections
            ),
            EndpointEvent::Data => tracing::trace!(
                "Traffic: {} bytes in, {} bytes out",
                stats.bytes_received,
                stats.bytes_sent
            ),
        }
    }

    fn on_protocol_data(&self, connection_id: &str, data: &ProtocolData) {
        match data.kind {
            ProtocolDataKind::HttpRequestHeader => {
                tracing::info!("[{}] {} {}", connection_id, data.method, data.path)
            }
            ProtocolDataKind::HttpResponseHeader => tracing::info!(
                "[{}] {} {} -> {} {}",
                connection_id,
                data.method,
                data.path,
                data.status,
                data.status_text
            ),
            ProtocolDataKind::HttpRequestBody | ProtocolDataKind::HttpResponseBody => {
                tracing::debug!(
                    "[{}] {} body, {} bytes",
                    connection_id,
                    data.id,
                    data.body_len
                )
            }
        }
    }
}
