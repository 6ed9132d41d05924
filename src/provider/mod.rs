//! Per-service authentication providers.
//!
//! Every backend service is served by one [`ServiceAuthenticationProvider`]:
//!
//! ```text
//! Basic         POST <url>/login, credentials stored under the scope
//! OAuth2        process-wide bearer token checked with the JwtValidator
//! Undetermined  mode not known yet; authenticate is a no-op
//! ```

mod basic;
mod oauth2;

pub use basic::BasicAuthProvider;
pub use oauth2::OAuth2AuthProvider;

use crate::config::ServiceAuthMode;
use crate::credentials::{AuthenticationScope, AuthenticationStatus};

/// Authentication strategy of one service
#[derive(Clone)]
pub enum ServiceAuthenticationProvider {
    /// Username/password login
    Basic(BasicAuthProvider),
    /// Identity-provider bearer token
    OAuth2(OAuth2AuthProvider),
    /// Mode not determined
    Undetermined(AuthenticationScope),
}

impl ServiceAuthenticationProvider {
    /// Scope of the service
    #[must_use]
    pub fn scope(&self) -> &AuthenticationScope {
        match self {
            Self::Basic(p) => p.scope(),
            Self::OAuth2(p) => p.scope(),
            Self::Undetermined(scope) => scope,
        }
    }

    /// Configured mode, `None` when undetermined
    #[must_use]
    pub fn mode(&self) -> Option<ServiceAuthMode> {
        match self {
            Self::Basic(_) => Some(ServiceAuthMode::Basic),
            Self::OAuth2(_) => Some(ServiceAuthMode::OAuth2),
            Self::Undetermined(_) => None,
        }
    }

    /// Authenticate; the OAuth2 variant ignores the credentials
    pub async fn authenticate(&self, username: &str, password: &str) -> AuthenticationStatus {
        match self {
            Self::Basic(p) => p.authenticate(username, password).await,
            Self::OAuth2(p) => p.authenticate().await,
            Self::Undetermined(_) => AuthenticationStatus::Undetermined,
        }
    }

    /// Log out; a no-op when undetermined
    pub async fn logout(&self) {
        match self {
            Self::Basic(p) => p.logout(),
            Self::OAuth2(p) => p.logout().await,
            Self::Undetermined(_) => {}
        }
    }
}

impl std::fmt::Debug for ServiceAuthenticationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Basic(_) => "Basic",
            Self::OAuth2(_) => "OAuth2",
            Self::Undetermined(_) => "Undetermined",
        };
        f.debug_struct("ServiceAuthenticationProvider")
            .field("kind", &kind)
            .field("scope", self.scope())
            .finish()
    }
}
