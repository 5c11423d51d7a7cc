use thiserror::Error;

use dertunnel_common::TlsSetupError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Must either define 'endpoint' or 'endpointPrefix'")]
    MissingEndpoint,

    #[error("Missing required option '{0}'")]
    MissingOption(&'static str),

    #[error("Local endpoints only support http protocol, got '{0}'")]
    UnsupportedScheme(String),

    #[error("Invalid local endpoint '{0}'")]
    InvalidLocal(String),

    #[error("Invalid service host '{0}'")]
    InvalidServiceHost(String),

    /// The initial connection attempt failed or was refused
    #[error("{0}")]
    Connection(String),

    #[error(transparent)]
    Tls(#[from] TlsSetupError),
}
