use http::Uri;

use dertunnel_common::{KeepaliveConfig, DEFAULT_SOCKET_BUFFER};

use crate::error::ClientError;

/// Host label under which the server accepts tunnel clients
pub const SERVICE_PREFIX: &str = "service.";

pub const DEFAULT_SERVICE_PORT: u16 = 443;

/// Local service that visitor channels are connected to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    pub host: String,
    pub port: u16,
}

impl LocalTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse an `http://host[:port]` URL; other schemes are refused
    pub fn from_url(url: &str) -> Result<Self, ClientError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| ClientError::InvalidLocal(url.to_string()))?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => return Err(ClientError::UnsupportedScheme(other.to_string())),
            None => return Err(ClientError::InvalidLocal(url.to_string())),
        }
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ClientError::InvalidLocal(url.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self::new(host, uri.port_u16().unwrap_or(80)))
    }

    /// A bare port means `127.0.0.1:<port>`, anything else must be a URL
    pub fn parse(spec: &str) -> Result<Self, ClientError> {
        match spec.parse::<u16>() {
            Ok(0) => Err(ClientError::InvalidLocal(spec.to_string())),
            Ok(port) => Ok(Self::new("127.0.0.1", port)),
            Err(_) => Self::from_url(spec),
        }
    }

    pub fn addr(&self) -> (&str, u16) {
        (&self.host, self.port)
    }
}

impl std::fmt::Display for LocalTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Prefix `service.` unless the host already carries it
pub fn service_host(host: &str) -> String {
    if host.starts_with(SERVICE_PREFIX) {
        host.to_string()
    } else {
        format!("{}{}", SERVICE_PREFIX, host)
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub user: String,
    pub token: String,
    /// Server host, with or without the `service.` label
    pub service_host: String,
    pub service_port: u16,
    pub local: LocalTarget,
    pub endpoint: Option<String>,
    pub endpoint_prefix: Option<String>,
    /// Make `connect_tunnel` wait for the first HELLO outcome
    pub wait_for_initial_connection: bool,
    /// Run the HTTP inspector over every channel
    pub inspect: bool,
    pub keepalive: KeepaliveConfig,
    /// Server data buffered for one local socket before its channel is dropped
    pub local_buffer: usize,
}

impl ClientOptions {
    pub fn new(
        user: impl Into<String>,
        token: impl Into<String>,
        service_host: impl Into<String>,
        local: LocalTarget,
    ) -> Self {
        Self {
            user: user.into(),
            token: token.into(),
            service_host: service_host.into(),
            service_port: DEFAULT_SERVICE_PORT,
            local,
            endpoint: None,
            endpoint_prefix: None,
            wait_for_initial_connection: true,
            inspect: false,
            keepalive: KeepaliveConfig::default(),
            local_buffer: DEFAULT_SOCKET_BUFFER,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_endpoint_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.endpoint_prefix = Some(prefix.into());
        self
    }

    /// Server host with the `service.` label, also used as TLS server name
    pub fn service_host(&self) -> String {
        service_host(&self.service_host)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        let has = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        if !has(&self.endpoint) && !has(&self.endpoint_prefix) {
            return Err(ClientError::MissingEndpoint);
        }
        if self.service_host.is_empty() {
            return Err(ClientError::MissingOption("service_host"));
        }
        if self.user.is_empty() {
            return Err(ClientError::MissingOption("user"));
        }
        if self.token.is_empty() {
            return Err(ClientError::MissingOption("token"));
        }
        if self.local.host.is_empty() || self.local.port == 0 {
            return Err(ClientError::MissingOption("local"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_target_from_url() {
        assert_eq!(
            LocalTarget::from_url("http://localhost:3000/app").unwrap(),
            LocalTarget::new("localhost", 3000)
        );
        assert_eq!(
            LocalTarget::from_url("http://intranet").unwrap(),
            LocalTarget::new("intranet", 80)
        );
        assert!(matches!(
            LocalTarget::from_url("https://localhost:3000"),
            Err(ClientError::UnsupportedScheme(s)) if s == "https"
        ));
        assert!(matches!(
            LocalTarget::from_url("localhost:3000"),
            Err(ClientError::InvalidLocal(_)) | Err(ClientError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_local_target_parse_port() {
        assert_eq!(
            LocalTarget::parse("8080").unwrap(),
            LocalTarget::new("127.0.0.1", 8080)
        );
        assert!(LocalTarget::parse("0").is_err());
        assert_eq!(LocalTarget::parse("8080").unwrap().to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_service_prefix() {
        assert_eq!(service_host("tunnel.example.com"), "service.tunnel.example.com");
        assert_eq!(
            service_host("service.tunnel.example.com"),
            "service.tunnel.example.com"
        );
    }

    #[test]
    fn test_validate() {
        let local = LocalTarget::new("127.0.0.1", 3000);
        let options = ClientOptions::new("alice", "secret", "example.com", local);
        assert!(matches!(
            options.validate(),
            Err(ClientError::MissingEndpoint)
        ));

        let options = options.with_endpoint("app");
        assert!(options.validate().is_ok());

        let mut missing_user = options.clone();
        missing_user.user.clear();
        assert!(matches!(
            missing_user.validate(),
            Err(ClientError::MissingOption("user"))
        ));
    }
}
