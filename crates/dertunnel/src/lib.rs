//! DerTunnel client library
//!
//! Keeps a control connection to a tunnel server alive and serves every
//! channel the server opens by connecting to the local service.

pub mod config;
mod engine;
mod error;
mod local;
mod observer;
mod options;
mod reconnect;
mod stats;
mod transport;

pub use engine::{connect_tunnel, ConnectionState, TunnelHandle};
pub use error::ClientError;
pub use local::LocalCounters;
pub use observer::{ClientStats, EndpointEvent, LogObserver, TunnelObserver};
pub use options::{service_host, ClientOptions, LocalTarget, DEFAULT_SERVICE_PORT, SERVICE_PREFIX};
pub use reconnect::ReconnectTimer;
pub use stats::{StatsTracker, STATS_INTERVAL};
pub use transport::{TlsTransport, Transport};
