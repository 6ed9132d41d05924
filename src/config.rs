//! Configuration management

use std::{collections::BTreeMap, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Directory under the user's home holding the trust store and credentials
pub const STATE_DIR_NAME: &str = ".controlroom";

/// File name of the pinned identity-provider certificates
pub const TRUSTSTORE_FILE_NAME: &str = "oidc_truststore.json";

/// File name of the persisted credential store
pub const CREDENTIALS_FILE_NAME: &str = "credentials.json";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity provider (OIDC) settings
    pub idp: IdentityProviderConfig,
    /// Certificate trust store settings
    pub trust: TrustConfig,
    /// Token verification settings
    pub oidc: OidcConfig,
    /// Credential store settings
    pub credentials: CredentialsConfig,
    /// Backend services keyed by authentication scope id
    pub services: BTreeMap<String, ServiceConfig>,
}

/// Identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityProviderConfig {
    /// Enable the OAuth2 login flow
    pub enabled: bool,
    /// Base URL of the identity provider (scheme, host, optional port and path)
    pub base_url: Option<String>,
    /// Realm path segment; empty means the base URL is the issuer
    pub realm: String,
    /// OAuth2 client id registered with the provider
    pub client_id: String,
    /// Local port of the redirect listener
    pub callback_port: u16,
    /// Path of the redirect listener
    pub callback_path: String,
    /// Connect timeout in milliseconds; zero or negative means no connect timeout
    pub connect_timeout_ms: i64,
}

impl Default for IdentityProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            realm: String::new(),
            client_id: "controlroom".to_string(),
            callback_port: 8080,
            callback_path: "/oauth2Callback".to_string(),
            connect_timeout_ms: 0,
        }
    }
}

impl IdentityProviderConfig {
    /// Connect timeout, or `None` when the HTTP client default applies
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        u64::try_from(self.connect_timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Trust store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Override for the trust store file location (supports `~`)
    pub path: Option<String>,
    /// HTTP CONNECT proxy used for certificate acquisition; falls back to `HTTPS_PROXY`
    pub proxy: Option<String>,
}

impl TrustConfig {
    /// Resolved trust store path
    pub fn resolved_path(&self) -> Result<PathBuf> {
        resolve_state_file(self.path.as_deref(), TRUSTSTORE_FILE_NAME)
    }
}

/// Token verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    /// How long a resolved JWKS key is reused; `0s` re-fetches on every check
    #[serde(with = "humantime_serde")]
    pub jwks_cache_ttl: Duration,
    /// Claim naming the user when an `Authorization: Bearer` header is checked
    pub username_claim: String,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            jwks_cache_ttl: Duration::from_secs(3600),
            username_claim: "name".to_string(),
        }
    }
}

/// Credential store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Override for the credential store file location (supports `~`)
    pub path: Option<String>,
}

impl CredentialsConfig {
    /// Resolved credential store path
    pub fn resolved_path(&self) -> Result<PathBuf> {
        resolve_state_file(self.path.as_deref(), CREDENTIALS_FILE_NAME)
    }
}

/// How a backend service authenticates its users
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAuthMode {
    /// Username/password posted to `<url>/login`
    #[default]
    Basic,
    /// Bearer token obtained from the identity provider
    #[serde(rename = "oauth2")]
    OAuth2,
}

/// Backend service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Human-readable name; defaults to the scope id
    #[serde(default)]
    pub display_name: Option<String>,
    /// Service base URL (the login endpoint is `<url>/login`)
    pub url: String,
    /// Authentication mode
    #[serde(default)]
    pub mode: ServiceAuthMode,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (CONTROLROOM_AUTH_ prefix)
        figment = figment.merge(Env::prefixed("CONTROLROOM_AUTH_").split("__"));

        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }
}

/// Resolve a state file, honoring an explicit override
fn resolve_state_file(explicit: Option<&str>, file_name: &str) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(expand_tilde(p));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))?;
    Ok(home.join(STATE_DIR_NAME).join(file_name))
}

/// Expand a leading `~` to the home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches('/'));
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_connect_timeout_means_none() {
        let mut idp = IdentityProviderConfig::default();
        assert_eq!(idp.connect_timeout(), None);

        idp.connect_timeout_ms = -5;
        assert_eq!(idp.connect_timeout(), None);

        idp.connect_timeout_ms = 2500;
        assert_eq!(idp.connect_timeout(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn explicit_path_wins() {
        let trust = TrustConfig {
            path: Some("/tmp/pinned.json".to_string()),
            proxy: None,
        };
        assert_eq!(trust.resolved_path().unwrap(), PathBuf::from("/tmp/pinned.json"));
    }

    #[test]
    fn loads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.yaml");
        std::fs::write(
            &path,
            r"
idp:
  enabled: true
  base_url: https://idp.example.org
  realm: controlroom
  client_id: desktop
oidc:
  jwks_cache_ttl: 5m
  username_claim: preferred_username
services:
  logbook:
    display_name: Logbook
    url: https://olog.example.org/Olog
  save-and-restore:
    url: https://sar.example.org
    mode: oauth2
",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(config.idp.enabled);
        assert_eq!(config.idp.client_id, "desktop");
        assert_eq!(config.idp.callback_path, "/oauth2Callback");
        assert_eq!(config.oidc.jwks_cache_ttl, Duration::from_secs(300));
        assert_eq!(config.oidc.username_claim, "preferred_username");
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services["logbook"].mode, ServiceAuthMode::Basic);
        assert_eq!(config.services["save-and-restore"].mode, ServiceAuthMode::OAuth2);
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/auth.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
