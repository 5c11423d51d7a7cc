//! Raw TLS visitor for byte-level checks of endpoint routing

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use dertunnel_common::ServerTrust;

/// A public client connected to one host name of the tunnel server
pub struct Visitor {
    stream: TlsStream<TcpStream>,
}

impl Visitor {
    pub async fn connect(addr: SocketAddr, host: &str, trust: &ServerTrust) -> io::Result<Self> {
        let config = dertunnel_common::load_client_config(trust)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tcp = TcpStream::connect(addr).await?;
        let stream = TlsConnector::from(Arc::new(config))
            .connect(server_name, tcp)
            .await?;
        Ok(Self { stream })
    }

    pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    /// Read until the server closes; errors count as closed
    pub async fn read_to_close(&mut self) -> Vec<u8> {
        let mut data = Vec::new();
        let _ = self.stream.read_to_end(&mut data).await;
        data
    }

    /// Send a `Connection: close` GET and return the raw response
    pub async fn get(&mut self, host: &str, path: &str) -> io::Result<String> {
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, host
        );
        self.send(request.as_bytes()).await?;
        Ok(String::from_utf8_lossy(&self.read_to_close().await).into_owned())
    }
}
