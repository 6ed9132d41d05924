//! Credential value types shared by the store, the providers and API clients.

use std::fmt;
use std::hash::{Hash, Hasher};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

use crate::oidc::UnverifiedClaims;

/// Identifies one backend service's credential namespace.
///
/// Two scopes are equal when their ids are equal; the display name is
/// presentation only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationScope {
    id: String,
    display_name: String,
}

impl AuthenticationScope {
    /// Create a scope
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// Opaque scope identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable name
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

impl PartialEq for AuthenticationScope {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AuthenticationScope {}

impl Hash for AuthenticationScope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for AuthenticationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Basic-auth credential pair bound to a scope
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedAuthenticationToken {
    /// Scope the credential belongs to
    pub scope: AuthenticationScope,
    /// Username
    pub username: Option<String>,
    /// Password
    pub password: Option<String>,
}

impl ScopedAuthenticationToken {
    /// Create a token for `scope`
    pub fn new(
        scope: AuthenticationScope,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }
}

impl fmt::Debug for ScopedAuthenticationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedAuthenticationToken")
            .field("scope", &self.scope)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Process-wide OAuth2 tokens issued by the identity provider
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    /// Access token presented as `Authorization: Bearer`
    pub access_token: String,
    /// ID token, used as `id_token_hint` on logout
    pub id_token: Option<String>,
}

impl BearerToken {
    /// Expiry (`exp`, Unix seconds) read without signature verification
    #[must_use]
    pub fn unverified_expiry(&self) -> Option<i64> {
        UnverifiedClaims::decode(&self.access_token).and_then(|c| c.expiry())
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("access_token", &"***")
            .field("id_token", &self.id_token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Outcome of a login attempt or cache check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthenticationStatus {
    /// Not attempted yet, or the outcome needs an interactive step
    Undetermined,
    /// Confirmed against the live service
    Authenticated,
    /// Credentials found in the store, not re-confirmed
    Cached,
    /// The service rejected the credentials
    BadCredentials,
    /// The service could not be reached
    ServiceOffline,
    /// Anything else
    UnknownError,
}

impl AuthenticationStatus {
    /// `Authenticated` and `Cached` both let API clients proceed
    #[must_use]
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Authenticated | Self::Cached)
    }
}

impl fmt::Display for AuthenticationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Undetermined => "undetermined",
            Self::Authenticated => "authenticated",
            Self::Cached => "cached",
            Self::BadCredentials => "bad credentials",
            Self::ServiceOffline => "service offline",
            Self::UnknownError => "unknown error",
        };
        f.write_str(s)
    }
}

/// How a scope was last authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Username/password stored under the scope
    Basic,
    /// Process-wide bearer token
    OAuth2,
}

impl AuthMode {
    /// Marker value persisted in the store
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::OAuth2 => "oauth2",
        }
    }

    /// Parse a persisted marker
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "basic" => Some(Self::Basic),
            "oauth2" => Some(Self::OAuth2),
            _ => None,
        }
    }
}

/// A credential an API client can put on the wire
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Username and password
    Basic {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// OAuth2 access token
    Bearer(String),
}

impl Credential {
    /// Value of the `Authorization` header
    #[must_use]
    pub fn authorization_header(&self) -> String {
        match self {
            Self::Basic { username, password } => {
                format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
            }
            Self::Bearer(token) => format!("Bearer {token}"),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Self::Bearer(_) => f.debug_tuple("Bearer").field(&"***").finish(),
        }
    }
}
