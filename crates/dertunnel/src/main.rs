use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dertunnel::config::{ClientConfig, Credentials, TOKEN_ENV};
use dertunnel::{connect_tunnel, ClientOptions, LocalTarget, LogObserver, TlsTransport};
use dertunnel_common::{load_ca_trust, ServerTrust};

const DEFAULT_CONFIG: &str = "dertunnel.toml";

/// DerTunnel - expose a local HTTP service through a tunnel server
#[derive(Parser, Debug)]
#[command(name = "dertunnel")]
#[command(about = "Expose a local service through a DerTunnel server")]
struct Cli {
    /// Requested endpoint label (e.g. `myapp` for myapp.<base domain>)
    endpoint: Option<String>,

    /// Local service: a port on 127.0.0.1 or an http:// URL
    local: Option<String>,

    /// Use ENDPOINT as a prefix; the server appends a random suffix
    #[arg(long)]
    prefix: bool,

    /// Tunnel server (host, host:port or https:// URL)
    #[arg(short, long)]
    service: Option<String>,

    /// User name
    #[arg(short, long)]
    user: Option<String>,

    /// Plain or packed connection token
    #[arg(short, long, env = "DERTUNNEL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Configuration file (defaults to ./dertunnel.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// PEM file with the CA certificate to trust
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Accept any server certificate
    #[arg(long)]
    ignore_cert_errors: bool,

    /// Do not log inspected HTTP traffic
    #[arg(long)]
    no_inspect: bool,
}

/// CLI flags merged over the configuration file
struct ResolvedConfig {
    credentials: Credentials,
    endpoint: String,
    local: LocalTarget,
    trust: ServerTrust,
}

impl ResolvedConfig {
    fn resolve(cli: &Cli) -> Result<Self> {
        let file = ClientConfig::load_optional(cli.config.as_deref(), Path::new(DEFAULT_CONFIG))?;

        let credentials = Credentials::resolve(
            cli.service.as_deref().or(file.service_url.as_deref()),
            cli.user.as_deref().or(file.user.as_deref()),
            cli.token.as_deref().or(file.token.as_deref()),
        )?;

        let endpoint = cli
            .endpoint
            .clone()
            .context("Endpoint required, e.g. `dertunnel myapp 3000`")?;
        let local = cli
            .local
            .as_deref()
            .context("Local service required, e.g. `dertunnel myapp 3000`")?;
        let local = LocalTarget::parse(local)?;

        let trust = if cli.ignore_cert_errors || file.ignore_cert_errors.unwrap_or(false) {
            ServerTrust::Insecure
        } else if let Some(ca) = cli.ca.clone().or(file.ca_cert.map(PathBuf::from)) {
            load_ca_trust(&ca)
                .with_context(|| format!("Failed to load CA certificate {}", ca.display()))?
        } else {
            ServerTrust::WebPki
        };

        Ok(Self {
            credentials,
            endpoint,
            local,
            trust,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();

    let level = if std::env::var_os("DERTUNNEL_DEBUG").is_some() {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("dertunnel={level}").parse()?)
                .add_directive(format!("dertunnel_common={level}").parse()?)
                .add_directive(format!("dertunnel_protocol={level}").parse()?),
        )
        .init();

    let config = match ResolvedConfig::resolve(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    let Credentials {
        service,
        user,
        token,
    } = config.credentials;
    let mut options = ClientOptions::new(user, token, service.host, config.local);
    options.service_port = service.port;
    options.inspect = !cli.no_inspect;
    options = if cli.prefix {
        options.with_endpoint_prefix(config.endpoint)
    } else {
        options.with_endpoint(config.endpoint)
    };

    let transport = TlsTransport::new(&options.service_host(), options.service_port, &config.trust)
        .context("Failed to set up TLS")?;
    let local = options.local.clone();

    let handle = connect_tunnel(options, transport, Arc::new(LogObserver))
        .await
        .context("Failed to open tunnel")?;
    if let Some(endpoint) = handle.endpoint() {
        println!("Forwarding https://{} -> {}", endpoint, local);
    }

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, closing tunnel...");
    let stats = handle.stats();
    handle.close().await;

    tracing::info!(
        "Served {} connections, {} bytes in, {} bytes out",
        stats.total_connections,
        stats.bytes_received,
        stats.bytes_sent
    );
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
