//! Authorization-code exchange and end-session calls against the identity provider.

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::oidc::OidcEndpoints;
use crate::{Error, Result};

/// Token endpoint response
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,
    /// ID token
    #[serde(default)]
    pub id_token: Option<String>,
    /// Refresh token (not used)
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Token type
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// Client for the provider's token and logout endpoints
#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    endpoints: OidcEndpoints,
    client_id: String,
    redirect_uri: String,
}

impl TokenClient {
    /// Create a token client
    pub fn new(
        http: reqwest::Client,
        endpoints: OidcEndpoints,
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoints,
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
        }
    }

    /// Endpoint layout
    #[must_use]
    pub fn endpoints(&self) -> &OidcEndpoints {
        &self.endpoints
    }

    /// Redirect URI sent with the authorization and token requests
    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// URL the operator opens in a browser to log in
    pub fn authorization_url(&self) -> Result<Url> {
        self.endpoints
            .authorization_url(&self.client_id, &self.redirect_uri)
    }

    /// Exchange an authorization code for tokens.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenExchange`] when the endpoint answers anything but
    /// 200, [`Error::Transport`] when it cannot be reached and
    /// [`Error::Protocol`] when the body is not a token response.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("scope", "openid"),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
        ];

        let url = self.endpoints.token_url();
        debug!(url = %url, "Exchanging authorization code");
        let response = self
            .http
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Token request failed: {e}")))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Token endpoint rejected the authorization code");
            return Err(Error::TokenExchange {
                status: status.as_u16(),
                body,
            });
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Failed to parse token response: {e}")))?;
        info!("Authorization code exchanged");
        Ok(tokens)
    }

    /// End the provider session.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or is answered with a non-success status.
    pub async fn end_session(&self, id_token: Option<&str>) -> Result<()> {
        let url = self.endpoints.logout_url(id_token)?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Logout request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() && !status.is_redirection() {
            return Err(Error::Protocol(format!("Logout returned HTTP {status}")));
        }
        debug!("Identity provider session ended");
        Ok(())
    }
}
