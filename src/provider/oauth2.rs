//! Bearer-token authentication backed by the identity provider.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::credentials::{AuthMode, AuthenticationScope, AuthenticationStatus, ScopedCredentialStore};
use crate::oauth::OAuth2CallbackListener;
use crate::oidc::JwtValidator;
use crate::Error;

/// OAuth2 provider for one service.
///
/// The bearer token is process-wide; this provider only decides whether the
/// stored token is usable for its scope.
#[derive(Clone)]
pub struct OAuth2AuthProvider {
    scope: AuthenticationScope,
    validator: Arc<JwtValidator>,
    store: Arc<ScopedCredentialStore>,
    listener: Option<Arc<OAuth2CallbackListener>>,
}

impl OAuth2AuthProvider {
    /// Create a provider; `listener` performs the provider logout when present
    pub fn new(
        scope: AuthenticationScope,
        validator: Arc<JwtValidator>,
        store: Arc<ScopedCredentialStore>,
        listener: Option<Arc<OAuth2CallbackListener>>,
    ) -> Self {
        Self {
            scope,
            validator,
            store,
            listener,
        }
    }

    /// Scope the auth mode is recorded under
    #[must_use]
    pub fn scope(&self) -> &AuthenticationScope {
        &self.scope
    }

    /// Check the stored bearer token.
    ///
    /// `Undetermined` means the interactive browser login is needed.
    pub async fn authenticate(&self) -> AuthenticationStatus {
        let Some(token) = self.store.bearer_token() else {
            debug!(scope = %self.scope, "No bearer token stored");
            return AuthenticationStatus::Undetermined;
        };

        match self.validator.validate(&token.access_token).await {
            Ok(_) => match self.store.set_auth_mode(&self.scope, AuthMode::OAuth2) {
                Ok(()) => {
                    info!(scope = %self.scope, "Bearer token accepted");
                    AuthenticationStatus::Authenticated
                }
                Err(e) => {
                    warn!(scope = %self.scope, error = %e, "Failed to record auth mode");
                    e.status()
                }
            },
            Err(Error::TokenValidation(reason)) => {
                info!(scope = %self.scope, %reason, "Stored bearer token rejected, clearing it");
                if let Err(e) = self.store.clear_bearer_token() {
                    warn!(error = %e, "Failed to clear bearer token");
                }
                AuthenticationStatus::Undetermined
            }
            Err(e) => {
                // The token may still be good; only the check could not run.
                let status = e.status();
                warn!(scope = %self.scope, error = %e, %status, "Bearer token check failed, keeping token");
                status
            }
        }
    }

    /// End the provider session and forget the scope's auth mode
    pub async fn logout(&self) {
        let cleared = match &self.listener {
            Some(listener) => listener.logout().await,
            None => self.store.clear_bearer_token(),
        };
        if let Err(e) = cleared.and_then(|()| self.store.clear_auth_mode(&self.scope)) {
            warn!(scope = %self.scope, error = %e, "OAuth2 logout incomplete");
        }
    }
}
