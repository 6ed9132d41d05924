//! Authentication service
//!
//! Wires the trust store, token verification, the redirect listener, the
//! credential store and one provider per configured backend service. Public
//! operations report [`AuthenticationStatus`] values; raw errors are logged
//! and collapsed.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Config, ServiceAuthMode};
use crate::credentials::{AuthenticationScope, AuthenticationStatus, ScopedCredentialStore};
use crate::http::build_http_client;
use crate::oauth::{ListenerState, OAuth2CallbackListener, TokenClient};
use crate::oidc::{
    JwksKeyResolver, JwtValidator, OidcEndpoints, VerifiedClaims, redirect_uri, unverified_username,
};
use crate::provider::{BasicAuthProvider, OAuth2AuthProvider, ServiceAuthenticationProvider};
use crate::trust::{CertificateTrustStore, install_process_default};
use crate::{Error, Result};

/// One row of the login overview
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    /// Scope id
    pub scope: String,
    /// Display name
    pub display_name: String,
    /// Cached status
    pub status: AuthenticationStatus,
    /// User the service is authenticated as
    pub username: Option<String>,
}

/// Outcome of a browser login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthLoginResult {
    /// Final listener state; `Idle` when the identity provider is disabled
    pub outcome: ListenerState,
    /// Status of every OAuth2 service after the login
    pub services: Vec<(AuthenticationScope, AuthenticationStatus)>,
}

/// Everything needed to authenticate against the configured services
pub struct AuthenticationService {
    config: Config,
    trust: Arc<CertificateTrustStore>,
    store: Arc<ScopedCredentialStore>,
    validator: Option<Arc<JwtValidator>>,
    listener: Option<Arc<OAuth2CallbackListener>>,
    providers: Vec<ServiceAuthenticationProvider>,
}

impl AuthenticationService {
    /// Build from `config`, opening the trust store and credential store at
    /// their configured paths.
    ///
    /// # Errors
    ///
    /// Returns an error if a store path or the identity provider URL is invalid
    /// or an HTTP client cannot be built.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store = Arc::new(ScopedCredentialStore::open(config.credentials.resolved_path()?));
        Self::with_store(config, store).await
    }

    /// Build from `config` around an existing credential store
    ///
    /// # Errors
    ///
    /// See [`Self::from_config`].
    pub async fn with_store(config: Config, store: Arc<ScopedCredentialStore>) -> Result<Self> {
        let trust = Arc::new(CertificateTrustStore::from_config(&config)?);
        let tls = if config.idp.enabled {
            trust.tls_context().await?
        } else {
            trust.pinned_context().await?
        };
        let http = build_http_client(&tls, config.idp.connect_timeout())?;
        install_process_default(tls);

        let (validator, listener) = if config.idp.enabled {
            let endpoints = OidcEndpoints::from_config(&config.idp)?;
            let validator = Arc::new(JwtValidator::new(
                JwksKeyResolver::new(http.clone()),
                endpoints.issuer(),
                config.oidc.jwks_cache_ttl,
            )
            .with_username_claim(config.oidc.username_claim.clone()));
            let tokens = Arc::new(TokenClient::new(
                http.clone(),
                endpoints,
                config.idp.client_id.clone(),
                redirect_uri(config.idp.callback_port, &config.idp.callback_path),
            ));
            let listener = Arc::new(OAuth2CallbackListener::new(tokens, Arc::clone(&store)));
            (Some(validator), Some(listener))
        } else {
            (None, None)
        };

        let providers = config
            .services
            .iter()
            .map(|(id, service)| {
                let scope = AuthenticationScope::new(
                    id.clone(),
                    service.display_name.clone().unwrap_or_else(|| id.clone()),
                );
                match (service.mode, &validator) {
                    (ServiceAuthMode::Basic, _) => ServiceAuthenticationProvider::Basic(
                        BasicAuthProvider::new(scope, &service.url, http.clone(), Arc::clone(&store)),
                    ),
                    (ServiceAuthMode::OAuth2, Some(validator)) => {
                        ServiceAuthenticationProvider::OAuth2(OAuth2AuthProvider::new(
                            scope,
                            Arc::clone(validator),
                            Arc::clone(&store),
                            listener.clone(),
                        ))
                    }
                    (ServiceAuthMode::OAuth2, None) => {
                        warn!(scope = %id, "OAuth2 service configured but the identity provider is disabled");
                        ServiceAuthenticationProvider::Undetermined(scope)
                    }
                }
            })
            .collect();

        Ok(Self {
            config,
            trust,
            store,
            validator,
            listener,
            providers,
        })
    }

    /// Refresh the pinned certificates and start the redirect listener.
    ///
    /// Does nothing when the identity provider is disabled. Clients built
    /// before a refresh keep the trust they were built with.
    ///
    /// # Errors
    ///
    /// Returns an error if the redirect listener cannot be started.
    pub async fn initialize(&self) -> Result<()> {
        let Some(listener) = &self.listener else {
            debug!("Identity provider disabled, skipping OAuth2 initialization");
            return Ok(());
        };

        if self.trust.refresh_certificates().await {
            install_process_default(self.trust.tls_context().await?);
        } else {
            warn!(
                error = self.trust.last_connection_error().as_deref().unwrap_or("unknown"),
                "Could not refresh identity provider certificates"
            );
        }

        match listener
            .start(self.config.idp.callback_port, &self.config.idp.callback_path)
            .await
        {
            Ok(_) | Err(Error::AlreadyRunning(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Trust store
    #[must_use]
    pub fn trust_store(&self) -> &Arc<CertificateTrustStore> {
        &self.trust
    }

    /// Credential store
    #[must_use]
    pub fn credential_store(&self) -> &Arc<ScopedCredentialStore> {
        &self.store
    }

    /// Token validator, when the identity provider is enabled
    #[must_use]
    pub fn validator(&self) -> Option<&Arc<JwtValidator>> {
        self.validator.as_ref()
    }

    /// Redirect listener, when the identity provider is enabled
    #[must_use]
    pub fn listener(&self) -> Option<&Arc<OAuth2CallbackListener>> {
        self.listener.as_ref()
    }

    /// Configured providers
    #[must_use]
    pub fn providers(&self) -> &[ServiceAuthenticationProvider] {
        &self.providers
    }

    /// Provider of `scope_id`
    #[must_use]
    pub fn provider(&self, scope_id: &str) -> Option<&ServiceAuthenticationProvider> {
        self.providers.iter().find(|p| p.scope().id() == scope_id)
    }

    /// Status from stored credentials only; no network call
    #[must_use]
    pub fn status(&self, scope_id: &str) -> AuthenticationStatus {
        let Some(provider) = self.provider(scope_id) else {
            return AuthenticationStatus::Undetermined;
        };
        self.cached_status(provider).0
    }

    /// Log in to one service
    pub async fn login(&self, scope_id: &str, username: &str, password: &str) -> AuthenticationStatus {
        match self.provider(scope_id) {
            Some(provider) => provider.authenticate(username, password).await,
            None => {
                warn!(scope = %scope_id, "Unknown service");
                AuthenticationStatus::UnknownError
            }
        }
    }

    /// Log out of one service; `false` if the scope is unknown
    pub async fn logout(&self, scope_id: &str) -> bool {
        match self.provider(scope_id) {
            Some(provider) => {
                provider.logout().await;
                info!(scope = %scope_id, "Logged out");
                true
            }
            None => {
                warn!(scope = %scope_id, "Unknown service");
                false
            }
        }
    }

    /// Log in to every service with the same credentials
    pub async fn login_all(
        &self,
        username: &str,
        password: &str,
    ) -> Vec<(AuthenticationScope, AuthenticationStatus)> {
        let mut results = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let status = provider.authenticate(username, password).await;
            results.push((provider.scope().clone(), status));
        }
        results
    }

    /// Log out of every service
    pub async fn logout_all(&self) {
        for provider in &self.providers {
            provider.logout().await;
        }
        info!("Logged out of all services");
    }

    /// Clear a stored bearer token whose unverified expiry is past or unreadable.
    ///
    /// Returns `true` if a token with a future expiry remains.
    pub fn check_stored_bearer(&self) -> bool {
        let Some(token) = self.store.bearer_token() else {
            return false;
        };
        let now = chrono::Utc::now().timestamp();
        match token.unverified_expiry() {
            Some(exp) if exp > now => true,
            expiry => {
                info!(expiry = ?expiry, "Stored bearer token expired, clearing it");
                if let Err(e) = self.store.clear_bearer_token() {
                    warn!(error = %e, "Failed to clear expired bearer token");
                }
                false
            }
        }
    }

    /// Verify the stored bearer token's signature and expiry.
    ///
    /// Returns `Ok(None)` when no token is stored. A token that fails
    /// verification is cleared before the error is returned; a key that
    /// cannot be fetched leaves the token in place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the identity provider is disabled and
    /// the validator's error otherwise.
    pub async fn verify_bearer_token(&self) -> Result<Option<VerifiedClaims>> {
        let validator = self
            .validator
            .as_ref()
            .ok_or_else(|| Error::Config("OAuth2 is not enabled (idp.enabled)".to_string()))?;
        let Some(token) = self.store.bearer_token() else {
            return Ok(None);
        };

        match validator.validate(&token.access_token).await {
            Ok(claims) => Ok(Some(claims)),
            Err(Error::TokenValidation(reason)) => {
                info!(%reason, "Stored bearer token rejected, clearing it");
                self.store.clear_bearer_token()?;
                Err(Error::TokenValidation(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Wait for the browser login to finish, then check the new token for
    /// every OAuth2 service.
    pub async fn complete_oauth_login(&self) -> OAuthLoginResult {
        let oauth_providers = self
            .providers
            .iter()
            .filter(|p| matches!(p, ServiceAuthenticationProvider::OAuth2(_)));

        let Some(listener) = &self.listener else {
            return OAuthLoginResult {
                outcome: ListenerState::Idle,
                services: oauth_providers
                    .map(|p| (p.scope().clone(), AuthenticationStatus::Undetermined))
                    .collect(),
            };
        };

        let outcome = listener.wait_for_completion().await;
        let mut services = Vec::new();
        for provider in oauth_providers {
            let status = match &outcome {
                ListenerState::Success => provider.authenticate("", "").await,
                _ => AuthenticationStatus::UnknownError,
            };
            services.push((provider.scope().clone(), status));
        }
        if let ListenerState::Failed(reason) = &outcome {
            warn!(reason = %reason, "OAuth2 login failed");
        }
        OAuthLoginResult { outcome, services }
    }

    /// End the identity-provider session and forget every OAuth2 auth mode
    pub async fn oauth_logout(&self) {
        match &self.listener {
            Some(listener) => {
                if let Err(e) = listener.logout().await {
                    warn!(error = %e, "Failed to clear bearer token");
                }
            }
            None => {
                if let Err(e) = self.store.clear_bearer_token() {
                    warn!(error = %e, "Failed to clear bearer token");
                }
            }
        }
        for provider in &self.providers {
            if matches!(provider, ServiceAuthenticationProvider::OAuth2(_)) {
                if let Err(e) = self.store.clear_auth_mode(provider.scope()) {
                    warn!(scope = %provider.scope(), error = %e, "Failed to clear auth mode");
                }
            }
        }
    }

    /// Per-service status rows sorted by display name
    #[must_use]
    pub fn overview(&self) -> Vec<ServiceStatus> {
        let mut rows: Vec<ServiceStatus> = self
            .providers
            .iter()
            .map(|provider| {
                let (status, username) = self.cached_status(provider);
                ServiceStatus {
                    scope: provider.scope().id().to_string(),
                    display_name: provider.scope().display_name().to_string(),
                    status,
                    username,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        rows
    }

    fn cached_status(
        &self,
        provider: &ServiceAuthenticationProvider,
    ) -> (AuthenticationStatus, Option<String>) {
        let scope = provider.scope();
        if let Some(token) = self.store.get(scope) {
            return (AuthenticationStatus::Cached, token.username);
        }

        if matches!(provider, ServiceAuthenticationProvider::OAuth2(_)) {
            if let Some(bearer) = self.store.bearer_token() {
                let now = chrono::Utc::now().timestamp();
                if bearer.unverified_expiry().is_some_and(|exp| exp > now) {
                    return (
                        AuthenticationStatus::Cached,
                        Some(unverified_username(&bearer.access_token)),
                    );
                }
            }
        }

        (AuthenticationStatus::Undetermined, None)
    }
}
