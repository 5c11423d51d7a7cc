use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use dertunnel_common::{load_client_config, ServerTrust};

use crate::error::ClientError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens control connections to the tunnel server
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self) -> io::Result<Self::Stream>;
}

/// TLS over TCP, with the service host as SNI
pub struct TlsTransport {
    connector: TlsConnector,
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    /// Skips name resolution of `host`
    address: Option<SocketAddr>,
}

impl TlsTransport {
    pub fn new(host: &str, port: u16, trust: &ServerTrust) -> Result<Self, ClientError> {
        let config = load_client_config(trust)?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ClientError::InvalidServiceHost(host.to_string()))?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            host: host.to_string(),
            port,
            server_name,
            address: None,
        })
    }

    /// Connect to `address` while still presenting the host name as SNI
    pub fn resolve_to(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }
}

#[async_trait]
impl Transport for TlsTransport {
    type Stream = TlsStream<TcpStream>;

    async fn connect(&self) -> io::Result<Self::Stream> {
        let connect = async {
            let tcp = match self.address {
                Some(address) => TcpStream::connect(address).await?,
                None => TcpStream::connect((self.host.as_str(), self.port)).await?,
            };
            tcp.set_nodelay(true)?;
            self.connector.connect(self.server_name.clone(), tcp).await
        };
        tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "Connection timed out"))?
    }
}
