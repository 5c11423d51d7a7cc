//! DerTunnel server library
//!
//! Accepts tunnel clients and public visitors on one TLS port and routes
//! visitor connections to the client owning the requested endpoint.

mod auth;
mod config;
mod credentials;
mod dispatcher;
mod error;
mod rate_limit;
mod server;
mod state;

pub use auth::{AllowAll, AuthCache, Authenticator, ClientCredential, ClientRegistry};
pub use config::{ResolvedServerConfig, ServerConfig};
pub use credentials::{generate_token, hash_token, verify_token, MIN_TOKEN_HASH_LEN, TOKEN_LEN};
pub use dispatcher::{ConnectionDispatcher, DispatcherConfig, SERVER_INFO};
pub use error::{DispatchError, HelloError};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use server::{route_server_name, Route, TunnelServer, RESERVED_LABELS, SERVICE_LABEL};
pub use state::{ClientInfo, EndpointInfo, EndpointSummary, FIRST_CHANNEL_ID};
