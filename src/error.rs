//! Error types for the authentication core

use std::io;

use thiserror::Error;

use crate::credentials::AuthenticationStatus;

/// Result type alias for the authentication core
pub type Result<T> = std::result::Result<T, Error>;

/// Authentication core errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// DNS, TCP, TLS or proxy tunnel failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unexpected HTTP status or malformed response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The service rejected the supplied username/password
    #[error("Bad credentials for {0}")]
    BadCredentials(String),

    /// Signature mismatch, expired or malformed token
    #[error("Token validation failed: {0}")]
    TokenValidation(String),

    /// Discovery document or JWKS could not yield an RSA key
    #[error("Key resolution failed: {0}")]
    KeyResolution(String),

    /// The token endpoint answered with a non-200 status
    #[error("Token exchange failed: HTTP {status}")]
    TokenExchange {
        /// HTTP status returned by the token endpoint
        status: u16,
        /// Response body, when one could be read
        body: String,
    },

    /// Trust store or credential store file unreadable or corrupt
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The callback listener is already bound
    #[error("Callback listener already running on {0}")]
    AlreadyRunning(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Collapse the error into the status reported to callers outside the core
    #[must_use]
    pub fn status(&self) -> AuthenticationStatus {
        match self {
            Self::Transport(_) | Self::KeyResolution(_) => AuthenticationStatus::ServiceOffline,
            Self::Http(e) if e.is_connect() || e.is_timeout() => {
                AuthenticationStatus::ServiceOffline
            }
            Self::BadCredentials(_) => AuthenticationStatus::BadCredentials,
            _ => AuthenticationStatus::UnknownError,
        }
    }

    /// HTTP status carried by the error, if any
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::TokenExchange { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
