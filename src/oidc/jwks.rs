//! JWKS key resolution through OIDC discovery.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tracing::debug;

use crate::{Error, Result};

/// RSA public key material taken from a JWKS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    /// Key id, if the JWKS named one
    pub kid: Option<String>,
    /// Big-endian modulus
    pub modulus: Vec<u8>,
    /// Big-endian public exponent
    pub exponent: Vec<u8>,
}

impl RsaPublicKey {
    /// Key usable for RS256 verification
    #[must_use]
    pub fn decoding_key(&self) -> DecodingKey {
        DecodingKey::from_rsa_raw_components(&self.modulus, &self.exponent)
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    #[serde(default)]
    jwks_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    #[serde(default)]
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize)]
struct JwkEntry {
    #[serde(default)]
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

/// Resolves the identity provider's signing key
#[derive(Debug, Clone)]
pub struct JwksKeyResolver {
    http: reqwest::Client,
}

impl JwksKeyResolver {
    /// Create a resolver; `http` must trust the identity provider
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Fetch the first RSA key published by `issuer`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyResolution`] if the discovery document or the JWKS
    /// cannot be fetched or parsed, `jwks_uri` is missing, no RSA key is
    /// published, or its components are not valid base64url.
    pub async fn fetch_public_key(&self, issuer: &str) -> Result<RsaPublicKey> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        let discovery: DiscoveryDocument = self.get_json(&discovery_url).await?;
        let jwks_uri = discovery
            .jwks_uri
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                Error::KeyResolution(format!("No jwks_uri in discovery document of {issuer}"))
            })?;

        debug!(jwks_uri = %jwks_uri, "Fetching JWKS");
        let jwks: JwksDocument = self.get_json(&jwks_uri).await?;
        first_rsa_key(jwks)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::KeyResolution(format!("GET {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::KeyResolution(format!("GET {url} returned HTTP {status}")));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::KeyResolution(format!("Unparsable response from {url}: {e}")))
    }
}

fn first_rsa_key(jwks: JwksDocument) -> Result<RsaPublicKey> {
    let jwk = jwks
        .keys
        .into_iter()
        .find(|k| k.kty == "RSA")
        .ok_or_else(|| Error::KeyResolution("JWKS contains no RSA key".to_string()))?;

    let n = jwk
        .n
        .ok_or_else(|| Error::KeyResolution("RSA key has no modulus".to_string()))?;
    let e = jwk
        .e
        .ok_or_else(|| Error::KeyResolution("RSA key has no exponent".to_string()))?;

    Ok(RsaPublicKey {
        kid: jwk.kid,
        modulus: decode_component(&n, "modulus")?,
        exponent: decode_component(&e, "exponent")?,
    })
}

fn decode_component(value: &str, what: &str) -> Result<Vec<u8>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| Error::KeyResolution(format!("Undecodable {what}: {e}")))?;
    if bytes.is_empty() {
        return Err(Error::KeyResolution(format!("Empty {what}")));
    }
    Ok(bytes)
}
