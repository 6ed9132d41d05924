//! JWT verification against the identity provider's JWKS.
//!
//! # Verification flow
//!
//! 1. Reject anything that is not three dot-separated segments.
//! 2. Resolve the RSA key (cached for `oidc.jwks_cache_ttl`).
//! 3. Verify the RS256 signature; on mismatch with a cached key, re-fetch the
//!    key once and retry so a rotated provider key is picked up.
//! 4. Require `exp` strictly in the future.
//!
//! Unverified payload reads live on [`UnverifiedClaims`] and are for display
//! and UX decisions only.

use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, Validation, errors::ErrorKind};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::jwks::{JwksKeyResolver, RsaPublicKey};
use crate::{Error, Result};

/// Display name used when a token carries no `preferred_username`
pub const FALLBACK_USERNAME: &str = "OAuth2";

/// Claim read by [`JwtValidator::authenticate_header`] unless configured otherwise
pub const DEFAULT_USERNAME_CLAIM: &str = "name";

const BEARER_PREFIX: &str = "Bearer ";

/// Claims of a token whose signature and expiry were checked
#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedClaims {
    /// Expiry (Unix seconds)
    pub exp: i64,
    /// Subject
    #[serde(default)]
    pub sub: Option<String>,
    /// Issuer
    #[serde(default)]
    pub iss: Option<String>,
    /// Login name shown to the operator
    #[serde(default)]
    pub preferred_username: Option<String>,
    /// Every other claim
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl VerifiedClaims {
    /// Claim rendered as text, named fields included; empty strings and `null` are absent
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<String> {
        let value = match name {
            "sub" => self.sub.clone(),
            "iss" => self.iss.clone(),
            "preferred_username" => self.preferred_username.clone(),
            "exp" => Some(self.exp.to_string()),
            _ => match self.other.get(name)? {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            },
        };
        value.filter(|v| !v.is_empty())
    }
}

struct CachedKey {
    key: RsaPublicKey,
    fetched_at: Instant,
}

/// Verifies bearer tokens issued by one identity provider
pub struct JwtValidator {
    resolver: JwksKeyResolver,
    issuer: String,
    cache_ttl: Duration,
    username_claim: String,
    cached: Mutex<Option<CachedKey>>,
}

impl JwtValidator {
    /// Create a validator for `issuer`; a zero `cache_ttl` re-fetches the key on every check
    #[must_use]
    pub fn new(resolver: JwksKeyResolver, issuer: impl Into<String>, cache_ttl: Duration) -> Self {
        Self {
            resolver,
            issuer: issuer.into(),
            cache_ttl,
            username_claim: DEFAULT_USERNAME_CLAIM.to_string(),
            cached: Mutex::new(None),
        }
    }

    /// Read the user from `claim` in [`Self::authenticate_header`]
    #[must_use]
    pub fn with_username_claim(mut self, claim: impl Into<String>) -> Self {
        self.username_claim = claim.into();
        self
    }

    /// Issuer whose keys are trusted
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// `true` only for a well-formed, correctly signed, unexpired token
    pub async fn is_valid(&self, jwt: &str) -> bool {
        match self.validate(jwt).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Token rejected");
                false
            }
        }
    }

    /// Verify `jwt` and return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenValidation`] for malformed, badly signed or
    /// expired tokens and [`Error::KeyResolution`] when no key can be fetched.
    pub async fn validate(&self, jwt: &str) -> Result<VerifiedClaims> {
        if jwt.split('.').count() != 3 {
            return Err(Error::TokenValidation(
                "Token is not a three-segment JWT".to_string(),
            ));
        }

        let (key, from_cache) = self.key(false).await?;
        let claims = match verify_signature(jwt, &key) {
            Err(Error::TokenValidation(reason)) if from_cache && reason == SIGNATURE_MISMATCH => {
                debug!("Signature mismatch with cached key, re-fetching JWKS");
                let (fresh, _) = self.key(true).await?;
                verify_signature(jwt, &fresh)?
            }
            other => other?,
        };

        let now = chrono::Utc::now().timestamp();
        if claims.exp <= now {
            return Err(Error::TokenValidation(format!(
                "Token expired at {}",
                claims.exp
            )));
        }
        Ok(claims)
    }

    /// Authenticate an HTTP `Authorization` header value.
    ///
    /// Returns `Ok(None)` when the header carries no bearer JWT, so the caller
    /// can fall through to other schemes. A bearer JWT must verify and carry
    /// the configured username claim.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenValidation`] when the token fails verification or
    /// lacks the username claim, [`Error::KeyResolution`] when no key can be
    /// fetched.
    pub async fn authenticate_header(&self, header: &str) -> Result<Option<String>> {
        let Some(jwt) = header.strip_prefix(BEARER_PREFIX).map(str::trim) else {
            return Ok(None);
        };
        if jwt.split('.').count() != 3 {
            debug!("Bearer credential is not a JWT, skipping");
            return Ok(None);
        }

        let claims = self.validate(jwt).await?;
        let username = claims.claim(&self.username_claim).ok_or_else(|| {
            Error::TokenValidation(format!("Token has no '{}' claim", self.username_claim))
        })?;
        debug!(%username, "Bearer header authenticated");
        Ok(Some(username))
    }

    /// Drop the cached key so the next check fetches it again
    pub fn invalidate_key(&self) {
        *self.cached.lock() = None;
    }

    /// Returns the key and whether it came from the cache
    async fn key(&self, force_refresh: bool) -> Result<(RsaPublicKey, bool)> {
        if !force_refresh && !self.cache_ttl.is_zero() {
            if let Some(cached) = self.cached.lock().as_ref() {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return Ok((cached.key.clone(), true));
                }
            }
        }

        let key = self.resolver.fetch_public_key(&self.issuer).await?;
        if !self.cache_ttl.is_zero() {
            *self.cached.lock() = Some(CachedKey {
                key: key.clone(),
                fetched_at: Instant::now(),
            });
        }
        Ok((key, false))
    }
}

const SIGNATURE_MISMATCH: &str = "signature mismatch";

fn verify_signature(jwt: &str, key: &RsaPublicKey) -> Result<VerifiedClaims> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.leeway = 0;
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp"]);

    jsonwebtoken::decode::<VerifiedClaims>(jwt, &key.decoding_key(), &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::InvalidSignature => Error::TokenValidation(SIGNATURE_MISMATCH.to_string()),
            ErrorKind::ExpiredSignature => Error::TokenValidation("Token expired".to_string()),
            _ => {
                warn!(error = %e, "Malformed or unsupported token");
                Error::TokenValidation(e.to_string())
            }
        })
}

/// Payload claims read WITHOUT signature verification
#[derive(Debug, Clone, PartialEq)]
pub struct UnverifiedClaims(Map<String, Value>);

impl UnverifiedClaims {
    /// Decode the payload segment; `None` for anything that is not a JSON object
    #[must_use]
    pub fn decode(jwt: &str) -> Option<Self> {
        let payload = jwt.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        match serde_json::from_slice::<Value>(&bytes).ok()? {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Claim rendered as text; numbers and booleans are formatted, `null` is absent
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<String> {
        match self.0.get(name)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// `exp` claim (Unix seconds)
    #[must_use]
    pub fn expiry(&self) -> Option<i64> {
        match self.0.get("exp")? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// `preferred_username` claim
    #[must_use]
    pub fn preferred_username(&self) -> Option<String> {
        self.claim("preferred_username").filter(|u| !u.is_empty())
    }
}

/// Read one payload claim without verification
#[must_use]
pub fn decode_payload_claim(jwt: &str, name: &str) -> Option<String> {
    UnverifiedClaims::decode(jwt)?.claim(name)
}

/// `exp` read without verification
#[must_use]
pub fn unverified_expiry(jwt: &str) -> Option<i64> {
    UnverifiedClaims::decode(jwt)?.expiry()
}

/// `preferred_username` read without verification, or [`FALLBACK_USERNAME`]
#[must_use]
pub fn unverified_username(jwt: &str) -> String {
    UnverifiedClaims::decode(jwt)
        .and_then(|c| c.preferred_username())
        .unwrap_or_else(|| FALLBACK_USERNAME.to_string())
}
