use thiserror::Error;

/// Reasons a HELLO_REQ is refused; the message is sent back to the client
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HelloError {
    #[error("Invalid state for HELLO_REQ")]
    InvalidState,

    #[error("Invalid tunnel protocol version")]
    Version,

    #[error("Value must be a valid user name")]
    InvalidUser,

    #[error("Too many connection attempts - Try again later")]
    RateLimited,

    #[error("Missing token")]
    MissingToken,

    #[error("Invalid endpoint name '{0}'")]
    InvalidEndpoint(String),

    #[error("Invalid username or token")]
    InvalidCredentials,

    #[error("Endpoint with this name is already in use")]
    EndpointInUse,

    #[error("Malformed HELLO_REQ: {0}")]
    Malformed(String),

    #[error("Internal error")]
    Internal,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Unknown endpoint '{0}'")]
    UnknownEndpoint(String),
}
