use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

use dertunnel_protocol::token;
use dertunnel_server::{
    generate_token, hash_token, AuthCache, ClientRegistry, ConnectionDispatcher, ServerConfig,
    TunnelServer,
};

/// Tunnel server - accepts tunnel clients and routes visitors to them
#[derive(Parser, Debug)]
#[command(name = "dertunnel-server")]
#[command(about = "Self-hosted TLS tunnel server")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "server.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a client token and the hash to put in the clients list
    CreateToken {
        /// User name, needed for the packed connection token
        #[arg(long)]
        user: Option<String>,

        /// Base domain, needed for the packed connection token
        #[arg(long)]
        base_domain: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::CreateToken { user, base_domain }) = args.command {
        create_token(user, base_domain);
        return Ok(());
    }

    // Install crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize logging
    let level = if std::env::var_os("DERTUNNEL_DEBUG").is_some() {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("dertunnel_server={level}").parse()?)
                .add_directive(format!("dertunnel_common={level}").parse()?)
                .add_directive(format!("dertunnel_protocol={level}").parse()?),
        )
        .init();

    tracing::info!("Starting tunnel server with config: {}", args.config);

    let config = ServerConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    tracing::info!("Base domain: {}", config.base_domain);
    tracing::info!("Listen port: {}", config.port);
    tracing::info!("Configured clients: {}", config.clients.len());

    let tls_config = dertunnel_common::load_server_config(
        Path::new(&config.cert_file),
        Path::new(&config.key_file),
    )
    .context("Failed to load TLS configuration")?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let authenticator =
        ClientRegistry::new(config.clients.clone(), Arc::new(AuthCache::default()));
    let dispatcher =
        ConnectionDispatcher::new(config.dispatcher_config(), Arc::new(authenticator));
    let server = TunnelServer::new(acceptor, dispatcher);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;

    tokio::select! {
        result = server.run(addr) => {
            tracing::error!("Tunnel server stopped: {:?}", result);
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn create_token(user: Option<String>, base_domain: Option<String>) {
    let token = generate_token();
    println!("Token:      {}", token);
    println!("Token hash: {}", hash_token(&token));

    match (user, base_domain) {
        (Some(user), Some(base_domain)) => {
            println!("Packed:     {}", token::pack(&base_domain, &user, &token));
        }
        _ => println!("Pass --user and --base-domain to also print a packed connection token"),
    }
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
