use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::dispatcher::ConnectionDispatcher;

/// Label under which tunnel clients reach the control service
pub const SERVICE_LABEL: &str = "service";

/// Labels that can never be used as endpoint names
pub const RESERVED_LABELS: &[&str] = &[SERVICE_LABEL, "admin", "app", "api"];

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where an incoming TLS connection goes, decided by its SNI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Control connection from a tunnel client
    Tunnel,
    /// Visitor for the named endpoint
    Endpoint(String),
    Reject,
}

/// Route a server name of the form `<label>.<base_domain>`
pub fn route_server_name(server_name: &str, base_domain: &str) -> Route {
    let server_name = server_name.to_lowercase();
    let Some(label) = server_name
        .strip_suffix(&base_domain.to_lowercase())
        .and_then(|rest| rest.strip_suffix('.'))
    else {
        return Route::Reject;
    };
    if label.is_empty() || label.contains('.') {
        return Route::Reject;
    }
    if label == SERVICE_LABEL {
        return Route::Tunnel;
    }
    if RESERVED_LABELS.contains(&label) {
        return Route::Reject;
    }
    Route::Endpoint(label.to_string())
}

/// TLS listener feeding the dispatcher
pub struct TunnelServer {
    acceptor: TlsAcceptor,
    dispatcher: Arc<ConnectionDispatcher>,
}

impl TunnelServer {
    pub fn new(acceptor: TlsAcceptor, dispatcher: Arc<ConnectionDispatcher>) -> Arc<Self> {
        Arc::new(Self {
            acceptor,
            dispatcher,
        })
    }

    pub fn dispatcher(&self) -> &Arc<ConnectionDispatcher> {
        &self.dispatcher
    }

    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        self.run_with_listener(listener).await
    }

    /// Accept connections from an already bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("Tunnel server listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let this = self.clone();

            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, peer_addr).await {
                    tracing::debug!("Connection from {} dropped: {:#}", peer_addr, e);
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let tls_stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(stream))
            .await
            .context("TLS handshake timed out")?
            .context("TLS handshake failed")?;

        let server_name = tls_stream
            .get_ref()
            .1
            .server_name()
            .unwrap_or_default()
            .to_string();
        let route = route_server_name(&server_name, self.dispatcher.base_domain());
        tracing::debug!("{} requested {:?} -> {:?}", peer_addr, server_name, route);

        match route {
            Route::Tunnel => {
                self.dispatcher
                    .clone()
                    .on_client_connect(tls_stream, peer_addr)
                    .await;
                Ok(())
            }
            Route::Endpoint(name) => {
                self.dispatcher
                    .clone()
                    .on_endpoint_connect(&name, tls_stream, peer_addr)
                    .await?;
                Ok(())
            }
            Route::Reject => anyhow::bail!("Unroutable server name {:?}", server_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_server_name() {
        let base = "tunnel.example.com";
        assert_eq!(
            route_server_name("service.tunnel.example.com", base),
            Route::Tunnel
        );
        assert_eq!(
            route_server_name("MyApp.Tunnel.Example.com", base),
            Route::Endpoint("myapp".to_string())
        );
        assert_eq!(route_server_name("tunnel.example.com", base), Route::Reject);
        assert_eq!(route_server_name(".tunnel.example.com", base), Route::Reject);
        assert_eq!(
            route_server_name("a.b.tunnel.example.com", base),
            Route::Reject
        );
        assert_eq!(route_server_name("app.other.com", base), Route::Reject);
        assert_eq!(route_server_name("", base), Route::Reject);
    }

    #[test]
    fn test_reserved_labels_are_not_endpoints() {
        let base = "tunnel.example.com";
        for label in ["admin", "app", "api"] {
            assert_eq!(
                route_server_name(&format!("{label}.{base}"), base),
                Route::Reject
            );
        }
    }

    #[test]
    fn test_suffix_must_be_label_boundary() {
        assert_eq!(
            route_server_name("appexample.com", "example.com"),
            Route::Reject
        );
    }
}
