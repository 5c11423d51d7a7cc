//! Server configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (DERTUNNEL_*)
//! 2. Config file (server.toml)
//! 3. Default values (where applicable)

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use dertunnel_common::validate::{is_valid_hostname, is_valid_user};
use dertunnel_common::KeepaliveConfig;

use crate::auth::ClientCredential;
use crate::credentials::MIN_TOKEN_HASH_LEN;
use crate::dispatcher::DispatcherConfig;

/// Environment variable prefix
const ENV_PREFIX: &str = "DERTUNNEL";

/// Server configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// TLS listen port
    pub port: Option<u16>,

    /// Endpoints are published as `<name>.<base_domain>`
    pub base_domain: Option<String>,

    /// PEM certificate chain, should cover `*.<base_domain>`
    pub cert_file: Option<String>,

    /// PEM private key
    pub key_file: Option<String>,

    /// Inline list of allowed clients
    pub clients: Vec<ClientCredential>,

    /// TOML file holding a `clients` list
    pub clients_file: Option<String>,

    /// Log HTTP exchanges on visitor channels
    pub inspect_traffic: Option<bool>,

    /// Allow a fixed endpoint to be claimed from a different user
    pub allow_endpoint_takeover: Option<bool>,

    pub keepalive_interval_secs: Option<u64>,

    pub pong_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ClientsFile {
    clients: Vec<ClientCredential>,
}

/// Validated server configuration
#[derive(Debug, Clone)]
pub struct ResolvedServerConfig {
    pub port: u16,
    pub base_domain: String,
    pub cert_file: String,
    pub key_file: String,
    pub clients: Vec<ClientCredential>,
    pub inspect_traffic: bool,
    pub allow_endpoint_takeover: bool,
    pub keepalive: KeepaliveConfig,
}

impl ResolvedServerConfig {
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let mut config = DispatcherConfig::new(self.base_domain.clone());
        config.keepalive = self.keepalive;
        config.inspect_traffic = self.inspect_traffic;
        config.allow_foreign_takeover = self.allow_endpoint_takeover;
        config
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn get_env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// Reject entries that could never authenticate
fn validate_clients(clients: &[ClientCredential]) -> Result<()> {
    for client in clients {
        if !is_valid_user(&client.user) {
            anyhow::bail!("Invalid client user name '{}'", client.user);
        }
        if client.token_hash.len() < MIN_TOKEN_HASH_LEN {
            anyhow::bail!(
                "Token hash of client '{}' is too short (at least {} characters)",
                client.user,
                MIN_TOKEN_HASH_LEN
            );
        }
    }
    Ok(())
}

fn load_clients_file(path: &str) -> Result<Vec<ClientCredential>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read clients file {}", path))?;
    let file: ClientsFile =
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path))?;
    Ok(file.clients)
}

impl ServerConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            tracing::info!("No config file at {}, using environment and defaults", path);
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
        let config = Self::parse(&content).with_context(|| format!("Failed to parse {}", path))?;
        tracing::info!("Loaded config from {}", path);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> Result<ResolvedServerConfig> {
        // Port: ENV > config > default 443
        let port = get_env_parsed("PORT").or(self.port).unwrap_or(443);

        // Base domain: ENV > config > required
        let base_domain = get_env("BASE_DOMAIN")
            .or(self.base_domain)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Base domain required. Set DERTUNNEL_BASE_DOMAIN or base_domain in config"
                )
            })?
            .to_lowercase();
        if !is_valid_hostname(&base_domain) {
            anyhow::bail!("Invalid base domain '{}'", base_domain);
        }

        let cert_file = get_env("CERT_FILE").or(self.cert_file).ok_or_else(|| {
            anyhow::anyhow!("Certificate required. Set DERTUNNEL_CERT_FILE or cert_file in config")
        })?;
        let key_file = get_env("KEY_FILE").or(self.key_file).ok_or_else(|| {
            anyhow::anyhow!("Private key required. Set DERTUNNEL_KEY_FILE or key_file in config")
        })?;

        // Clients: inline list plus optional clients file
        let mut clients = self.clients;
        if let Some(path) = get_env("CLIENTS_FILE").or(self.clients_file) {
            clients.extend(load_clients_file(&path)?);
        }
        validate_clients(&clients)?;
        if clients.is_empty() {
            tracing::warn!("No clients configured, every HELLO will be refused");
        }

        let inspect_traffic = get_env_bool("INSPECT_TRAFFIC")
            .or(self.inspect_traffic)
            .unwrap_or(false);
        let allow_endpoint_takeover = get_env_bool("ALLOW_ENDPOINT_TAKEOVER")
            .or(self.allow_endpoint_takeover)
            .unwrap_or(false);

        let defaults = KeepaliveConfig::default();
        let keepalive = KeepaliveConfig {
            interval: get_env_parsed("KEEPALIVE_INTERVAL_SECS")
                .or(self.keepalive_interval_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            pong_timeout: get_env_parsed("PONG_TIMEOUT_SECS")
                .or(self.pong_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.pong_timeout),
            max_missed: defaults.max_missed,
        };
        if keepalive.interval.is_zero() || keepalive.pong_timeout.is_zero() {
            anyhow::bail!("Keepalive interval and pong timeout must be positive");
        }

        Ok(ResolvedServerConfig {
            port,
            base_domain,
            cert_file,
            key_file,
            clients,
            inspect_traffic,
            allow_endpoint_takeover,
            keepalive,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> Result<ResolvedServerConfig> {
        Self::load(path)?.resolve()
    }
}
