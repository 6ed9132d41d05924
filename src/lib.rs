//! Control Room Authentication Core
//!
//! Identity and trust plumbing shared by the control-room desktop clients.
//!
//! # Features
//!
//! - **Certificate pinning**: trust-on-first-use capture of the identity
//!   provider's TLS chain, combined with the system CA bundle
//! - **OAuth2 login**: local redirect listener and authorization-code exchange
//! - **Token verification**: RS256 JWT checks against the provider's JWKS
//! - **Scoped credentials**: one persisted store for username/password and
//!   bearer credentials across backend services
//!
//! # Flow
//!
//! ```text
//! caller ──▶ AuthenticationService ──▶ ServiceAuthenticationProvider
//!                                          │ Basic: POST <url>/login
//!                                          │ OAuth2: OAuth2CallbackListener ──▶ token endpoint
//!                                          ▼
//!                 JwtValidator ──▶ JwksKeyResolver ──▶ CertificateTrustStore
//!                                          │
//!                                          ▼
//!                              ScopedCredentialStore ──▶ API clients
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod http;
pub mod oauth;
pub mod oidc;
pub mod provider;
pub mod service;
pub mod trust;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?;
        }
        _ => {
            subscriber
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?;
        }
    }

    Ok(())
}
