use std::path::Path;

use anyhow::{Context, Result};
use http::Uri;
use serde::Deserialize;

use dertunnel_protocol::token;

use crate::options::DEFAULT_SERVICE_PORT;

/// Environment variable holding the connection token
pub const TOKEN_ENV: &str = "DERTUNNEL_TOKEN";

/// Optional client configuration file (TOML); CLI flags take priority
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Tunnel server, e.g. `tunnel.example.com` or `https://tunnel.example.com:8443`
    pub service_url: Option<String>,
    pub user: Option<String>,
    /// Plain or packed connection token
    pub token: Option<String>,
    /// PEM file with the CA to trust instead of the web PKI roots
    pub ca_cert: Option<String>,
    pub ignore_cert_errors: Option<bool>,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load `path` if given; a missing default file is not an error
    pub fn load_optional(path: Option<&Path>, default: &Path) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if default.exists() => Self::load(default),
            None => Ok(Self::default()),
        }
    }
}

/// Host and port of the tunnel server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAddress {
    pub host: String,
    pub port: u16,
}

impl ServiceAddress {
    /// Accepts a bare host, `host:port`, or an `https://` URL
    pub fn parse(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .with_context(|| format!("Invalid service URL: {}", url))?;
        if let Some(scheme) = uri.scheme_str() {
            anyhow::ensure!(
                scheme == "https",
                "Unsupported service URL scheme: {}",
                scheme
            );
        }
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .with_context(|| format!("Service URL has no host: {}", url))?;
        Ok(Self {
            host: host.to_ascii_lowercase(),
            port: uri.port_u16().unwrap_or(DEFAULT_SERVICE_PORT),
        })
    }
}

/// Service, user and token after unpacking a packed token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub service: ServiceAddress,
    pub user: String,
    pub token: String,
}

impl Credentials {
    /// Explicit values win over the ones carried by a packed token
    pub fn resolve(
        service_url: Option<&str>,
        user: Option<&str>,
        token: Option<&str>,
    ) -> Result<Self> {
        let token = token
            .filter(|t| !t.is_empty())
            .with_context(|| format!("Token required. Use --token or {}", TOKEN_ENV))?;
        let unpacked = token::unpack_if_packed(token).context("Invalid connection token")?;

        let service_url = service_url
            .filter(|s| !s.is_empty())
            .or_else(|| Some(unpacked.service.as_str()).filter(|s| !s.is_empty()))
            .context("Service required. Use --service or a packed token")?;
        let user = user
            .filter(|u| !u.is_empty())
            .or_else(|| Some(unpacked.user.as_str()).filter(|u| !u.is_empty()))
            .context("User required. Use --user or a packed token")?;

        Ok(Self {
            service: ServiceAddress::parse(service_url)?,
            user: user.to_string(),
            token: unpacked.token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config = ClientConfig::parse(
            r#"
service_url = "https://tunnel.example.com:8443"
user = "alice"
ca_cert = "ca.pem"
ignore_cert_errors = true
"#,
        )
        .unwrap();
        assert_eq!(
            config.service_url.as_deref(),
            Some("https://tunnel.example.com:8443")
        );
        assert_eq!(config.user.as_deref(), Some("alice"));
        assert_eq!(config.token, None);
        assert_eq!(config.ignore_cert_errors, Some(true));

        assert!(ClientConfig::parse("unknown = 1").is_err());
    }

    #[test]
    fn test_missing_default_file_is_empty() {
        let config =
            ClientConfig::load_optional(None, Path::new("/nonexistent/dertunnel.toml")).unwrap();
        assert!(config.service_url.is_none());
        assert!(ClientConfig::load_optional(
            Some(Path::new("/nonexistent/dertunnel.toml")),
            Path::new("unused")
        )
        .is_err());
    }

    #[test]
    fn test_service_address() {
        assert_eq!(
            ServiceAddress::parse("tunnel.example.com").unwrap(),
            ServiceAddress {
                host: "tunnel.example.com".into(),
                port: 443
            }
        );
        assert_eq!(
            ServiceAddress::parse("Tunnel.Example.com:8443").unwrap().port,
            8443
        );
        assert_eq!(
            ServiceAddress::parse("https://service.example.com/").unwrap(),
            ServiceAddress {
                host: "service.example.com".into(),
                port: 443
            }
        );
        assert!(ServiceAddress::parse("http://tunnel.example.com").is_err());
    }

    #[test]
    fn test_credentials_from_packed_token() {
        let packed = token::pack("example.com", "alice", "abcdefghij0123456789klmn");
        let creds = Credentials::resolve(None, None, Some(&packed)).unwrap();
        assert_eq!(creds.service.host, "service.example.com");
        assert_eq!(creds.user, "alice");
        assert_eq!(creds.token, "abcdefghij0123456789klmn");

        let creds =
            Credentials::resolve(Some("other.example.com:9000"), Some("bob"), Some(&packed))
                .unwrap();
        assert_eq!(creds.service.host, "other.example.com");
        assert_eq!(creds.service.port, 9000);
        assert_eq!(creds.user, "bob");
    }

    #[test]
    fn test_credentials_from_plain_token() {
        let creds =
            Credentials::resolve(Some("example.com"), Some("alice"), Some("secret")).unwrap();
        assert_eq!(creds.token, "secret");
        assert_eq!(creds.service.host, "example.com");

        assert!(Credentials::resolve(Some("example.com"), None, Some("secret")).is_err());
        assert!(Credentials::resolve(None, Some("alice"), Some("secret")).is_err());
        assert!(Credentials::resolve(Some("example.com"), Some("alice"), None).is_err());
    }
}
