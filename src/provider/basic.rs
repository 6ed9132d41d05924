//! Username/password login against a service's `/login` endpoint.

use std::sync::Arc;

use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::credentials::{
    AuthMode, AuthenticationScope, AuthenticationStatus, ScopedAuthenticationToken,
    ScopedCredentialStore,
};
use crate::{Error, Result};

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Basic-auth provider for one service
#[derive(Clone)]
pub struct BasicAuthProvider {
    scope: AuthenticationScope,
    login_url: String,
    http: reqwest::Client,
    store: Arc<ScopedCredentialStore>,
}

impl BasicAuthProvider {
    /// Create a provider posting to `<service_url>/login`
    pub fn new(
        scope: AuthenticationScope,
        service_url: &str,
        http: reqwest::Client,
        store: Arc<ScopedCredentialStore>,
    ) -> Self {
        Self {
            scope,
            login_url: format!("{}/login", service_url.trim_end_matches('/')),
            http,
            store,
        }
    }

    /// Scope the credentials are stored under
    #[must_use]
    pub fn scope(&self) -> &AuthenticationScope {
        &self.scope
    }

    /// Login endpoint
    #[must_use]
    pub fn login_url(&self) -> &str {
        &self.login_url
    }

    /// Post the credentials; on success they are stored for the scope
    pub async fn authenticate(&self, username: &str, password: &str) -> AuthenticationStatus {
        match self.login(username, password).await {
            Ok(()) => {
                info!(scope = %self.scope, username = %username, "Authenticated");
                AuthenticationStatus::Authenticated
            }
            Err(e) => {
                let status = e.status();
                match status {
                    AuthenticationStatus::BadCredentials => {
                        info!(scope = %self.scope, username = %username, "Bad credentials");
                    }
                    _ => warn!(scope = %self.scope, error = %e, %status, "Basic login failed"),
                }
                status
            }
        }
    }

    async fn login(&self, username: &str, password: &str) -> Result<()> {
        debug!(scope = %self.scope, url = %self.login_url, "Basic login");
        let response = self
            .http
            .post(&self.login_url)
            .json(&LoginRequest { username, password })
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{}: {e}", self.login_url)))?;

        match response.status() {
            StatusCode::OK => {
                let token =
                    ScopedAuthenticationToken::new(self.scope.clone(), username, password);
                self.store.set(token)?;
                self.store.set_auth_mode(&self.scope, AuthMode::Basic)
            }
            StatusCode::UNAUTHORIZED => Err(Error::BadCredentials(username.to_string())),
            other => Err(Error::Protocol(format!(
                "unexpected login response {}",
                other.as_u16()
            ))),
        }
    }

    /// Forget the stored credentials
    pub fn logout(&self) {
        if let Err(e) = self
            .store
            .delete(&self.scope)
            .and_then(|()| self.store.clear_auth_mode(&self.scope))
        {
            warn!(scope = %self.scope, error = %e, "Failed to delete credentials");
        }
    }
}
