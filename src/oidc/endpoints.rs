//! Identity provider endpoint layout (Keycloak-style realms).

use url::Url;

use crate::config::IdentityProviderConfig;
use crate::{Error, Result};

/// Endpoint URLs derived from the issuer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcEndpoints {
    issuer: String,
}

impl OidcEndpoints {
    /// `<base_url>/realms/<realm>`, or `base_url` itself when `realm` is empty
    #[must_use]
    pub fn new(base_url: &str, realm: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let issuer = if realm.is_empty() {
            base.to_string()
        } else {
            format!("{base}/realms/{realm}")
        };
        Self { issuer }
    }

    /// Build from the identity provider config
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when no base URL is configured or it does not parse.
    pub fn from_config(idp: &IdentityProviderConfig) -> Result<Self> {
        let base_url = idp
            .base_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Config("idp.base_url is not configured".to_string()))?;
        Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid idp.base_url '{base_url}': {e}")))?;
        Ok(Self::new(base_url, &idp.realm))
    }

    /// Issuer base URL
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// OIDC discovery document
    #[must_use]
    pub fn discovery_url(&self) -> String {
        format!("{}/.well-known/openid-configuration", self.issuer)
    }

    /// Authorization-code token endpoint
    #[must_use]
    pub fn token_url(&self) -> String {
        format!("{}/protocol/openid-connect/token", self.issuer)
    }

    /// Browser authorization endpoint with the login query
    pub fn authorization_url(&self, client_id: &str, redirect_uri: &str) -> Result<Url> {
        let mut url = self.endpoint("auth")?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", client_id)
            .append_pair("scope", "openid email")
            .append_pair("redirect_uri", redirect_uri);
        Ok(url)
    }

    /// End-session endpoint; `id_token_hint` is attached when known
    pub fn logout_url(&self, id_token_hint: Option<&str>) -> Result<Url> {
        let mut url = self.endpoint("logout")?;
        if let Some(hint) = id_token_hint {
            url.query_pairs_mut()
                .append_pair("id_token_hint", hint)
                .append_pair("post_logout_redirect_uri", "");
        }
        Ok(url)
    }

    fn endpoint(&self, name: &str) -> Result<Url> {
        let raw = format!("{}/protocol/openid-connect/{name}", self.issuer);
        Url::parse(&raw).map_err(|e| Error::Config(format!("Invalid endpoint URL '{raw}': {e}")))
    }
}

/// Redirect URI registered with the identity provider
#[must_use]
pub fn redirect_uri(port: u16, callback_path: &str) -> String {
    if callback_path.starts_with('/') {
        format!("http://localhost:{port}{callback_path}")
    } else {
        format!("http://localhost:{port}/{callback_path}")
    }
}
