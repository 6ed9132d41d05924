//! Scoped credential storage.
//!
//! The store is the single source of truth other subsystems query to find out
//! whether a backend service is authenticated and which `Authorization`
//! header to send:
//!
//! - per-scope username/password tokens ([`ScopedAuthenticationToken`])
//! - a flat namespace for the OAuth2 access/ID tokens and per-scope
//!   auth-mode markers

mod store;
mod types;

pub use store::{ACCESS_TOKEN_KEY, ID_TOKEN_KEY, ScopedCredentialStore, StoreEvent};
pub use types::{
    AuthMode, AuthenticationScope, AuthenticationStatus, BearerToken, Credential,
    ScopedAuthenticationToken,
};
