use std::path::PathBuf;

use thiserror::Error;

/// Failures while building the server or client TLS configuration
#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("Failed to read {what} file {}: {source}", .path.display())]
    Read {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("TLS configuration rejected: {0}")]
    Config(#[from] rustls::Error),
}
