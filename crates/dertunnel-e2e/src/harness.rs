//! Test server harness for E2E tests
//!
//! Starts a complete tunnel server on an ephemeral port. Clients reach it
//! through `service.<base_domain>` resolved to the local listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use dertunnel::{connect_tunnel, ClientError, ClientOptions, LocalTarget, TlsTransport, TunnelHandle};
use dertunnel_common::ServerTrust;
use dertunnel_protocol::token;
use dertunnel_server::{
    hash_token, AuthCache, ClientCredential, ClientRegistry, ConnectionDispatcher,
    DispatcherConfig, TunnelServer,
};

use crate::certificates::TestCertificates;

pub const TEST_USER: &str = "alice";
pub const TEST_TOKEN: &str = "e2e0token0123456789abcde";

/// A running tunnel server
pub struct TestServer {
    pub addr: SocketAddr,
    pub base_domain: String,
    pub certs: Arc<TestCertificates>,
    server: Arc<TunnelServer>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Start with a tweaked dispatcher configuration
    pub async fn start_with(configure: impl FnOnce(&mut DispatcherConfig)) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let base_domain = "tunnel.test".to_string();
        let certs = Arc::new(TestCertificates::generate(&base_domain));

        let tls_config = dertunnel_common::load_server_config_from_pem(
            &certs.server_cert_pem,
            &certs.server_key_pem,
        )
        .expect("Failed to load server TLS config");
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let clients = vec![
            ClientCredential {
                user: TEST_USER.to_string(),
                token_hash: hash_token(TEST_TOKEN),
            },
            ClientCredential {
                user: "bob".to_string(),
                token_hash: hash_token("bob0token0123456789abcde"),
            },
        ];
        let authenticator = ClientRegistry::new(clients, Arc::new(AuthCache::default()));

        let mut config = DispatcherConfig::new(base_domain.clone());
        configure(&mut config);
        let dispatcher = ConnectionDispatcher::new(config, Arc::new(authenticator));
        let server = TunnelServer::new(acceptor, dispatcher);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind tunnel server");
        let addr = listener.local_addr().unwrap();

        let task = tokio::spawn({
            let server = server.clone();
            async move {
                if let Err(e) = server.run_with_listener(listener).await {
                    tracing::error!("Tunnel server error: {}", e);
                }
            }
        });

        Self {
            addr,
            base_domain,
            certs,
            server,
            task,
        }
    }

    pub fn dispatcher(&self) -> &Arc<ConnectionDispatcher> {
        self.server.dispatcher()
    }

    /// Public host name of `label`
    pub fn host_for(&self, label: &str) -> String {
        format!("{}.{}", label, self.base_domain)
    }

    pub fn url_for(&self, label: &str, path: &str) -> String {
        format!("https://{}:{}{}", self.host_for(label), self.addr.port(), path)
    }

    pub fn trust(&self) -> ServerTrust {
        ServerTrust::CaPem(self.certs.ca_cert_pem.clone())
    }

    /// Connection token carrying service, user and token
    pub fn packed_token(&self) -> String {
        token::pack(&self.base_domain, TEST_USER, TEST_TOKEN)
    }

    /// Options for the test user exposing `127.0.0.1:<local_port>` as `endpoint`
    pub fn client_options(&self, endpoint: &str, local_port: u16) -> ClientOptions {
        let mut options = ClientOptions::new(
            TEST_USER,
            TEST_TOKEN,
            self.base_domain.clone(),
            LocalTarget::new("127.0.0.1", local_port),
        )
        .with_endpoint(endpoint);
        options.service_port = self.addr.port();
        options
    }

    pub fn transport(&self, options: &ClientOptions) -> TlsTransport {
        TlsTransport::new(&options.service_host(), options.service_port, &self.trust())
            .expect("Failed to build transport")
            .resolve_to(self.addr)
    }

    /// Open a tunnel and wait for the HELLO outcome
    pub async fn connect(&self, options: ClientOptions) -> Result<TunnelHandle, ClientError> {
        let transport = self.transport(&options);
        connect_tunnel(options, transport, Arc::new(dertunnel::LogObserver)).await
    }

    /// HTTPS client resolving `label`'s host name to this server
    pub fn http_client(&self, label: &str) -> reqwest::Client {
        let ca = reqwest::Certificate::from_pem(self.certs.ca_cert_pem.as_bytes())
            .expect("Invalid CA certificate");
        reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .resolve(&self.host_for(label), self.addr)
            .build()
            .expect("Failed to build HTTP client")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
