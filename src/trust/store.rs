//! Certificate trust store
//!
//! Pins the identity provider's certificate chain on first contact and
//! persists it between runs. The file carries an HMAC-SHA256 over its entries,
//! keyed by a fixed password. This detects corruption, not tampering.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::acquire::{self, describe};
use super::context::TlsContext;
use super::proxy;
use crate::config::Config;
use crate::{Error, Result};

/// Timeout for the TCP connect and TLS handshake of an acquisition
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

const STORE_PASSWORD: &[u8] = b"changeit";
const FILE_VERSION: u32 = 1;

/// One pinned certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedCertificateEntry {
    /// `<host>_<index>`, index 0 being the leaf
    pub alias: String,
    /// DER encoding
    #[serde(with = "der_base64")]
    pub certificate: Vec<u8>,
    /// When the chain was captured
    pub acquired_at: DateTime<Utc>,
}

impl TrustedCertificateEntry {
    /// Subject, issuer and expiry for display
    #[must_use]
    pub fn summary(&self) -> String {
        describe(&self.certificate)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TrustStoreFile {
    version: u32,
    entries: Vec<TrustedCertificateEntry>,
    mac: String,
}

/// Persisted set of pinned identity-provider certificates
pub struct CertificateTrustStore {
    path: PathBuf,
    provider_url: Option<String>,
    proxy: Option<String>,
    connect_timeout: Duration,
    entries: Mutex<BTreeMap<String, TrustedCertificateEntry>>,
    context: RwLock<Option<TlsContext>>,
    last_error: RwLock<Option<String>>,
}

impl CertificateTrustStore {
    /// Open the store at `path`; a missing or unusable file yields an empty store
    #[must_use]
    pub fn open(path: PathBuf, provider_url: Option<String>, proxy: Option<String>) -> Self {
        let entries = load_file(&path);
        Self {
            path,
            provider_url: provider_url.filter(|u| !u.is_empty()),
            proxy,
            connect_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            entries: Mutex::new(entries),
            context: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    /// Open the store described by `config`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the store path cannot be resolved.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::open(
            config.trust.resolved_path()?,
            config.idp.base_url.clone(),
            config.trust.proxy.clone(),
        ))
    }

    /// Override the acquisition timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identity provider URL used by [`Self::refresh_certificates`]
    #[must_use]
    pub fn provider_url(&self) -> Option<&str> {
        self.provider_url.as_deref()
    }

    /// Message of the most recent failed acquisition
    #[must_use]
    pub fn last_connection_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Pinned entries ordered by alias
    pub async fn entries(&self) -> Vec<TrustedCertificateEntry> {
        self.entries.lock().await.values().cloned().collect()
    }

    /// Capture and pin the chain served at `url`.
    ///
    /// Returns `false` on any failure; the reason is available from
    /// [`Self::last_connection_error`].
    pub async fn acquire_certificates(&self, url: &str) -> bool {
        match self.try_acquire(url).await {
            Ok(count) => {
                info!(url = %url, certificates = count, "Pinned identity provider certificates");
                *self.last_error.write() = None;
                true
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Certificate acquisition failed");
                *self.last_error.write() = Some(e.to_string());
                false
            }
        }
    }

    /// Re-acquire from the configured provider URL
    pub async fn refresh_certificates(&self) -> bool {
        let Some(url) = self.provider_url.clone() else {
            *self.last_error.write() =
                Some("No identity provider URL configured".to_string());
            return false;
        };
        self.acquire_certificates(&url).await
    }

    /// Composite context of the system roots and pinned certificates.
    ///
    /// An empty store with a configured provider URL is populated first; a
    /// failed acquisition still yields a system-roots context.
    pub async fn tls_context(&self) -> Result<TlsContext> {
        if let Some(ctx) = self.context.read().clone() {
            return Ok(ctx);
        }

        let empty = self.entries.lock().await.is_empty();
        if empty {
            if let Some(url) = self.provider_url.clone() {
                self.acquire_certificates(&url).await;
            }
        }
        self.pinned_context().await
    }

    /// Context from the certificates already pinned; never contacts the provider
    pub async fn pinned_context(&self) -> Result<TlsContext> {
        let entries = self.entries.lock().await;
        if let Some(ctx) = self.context.read().clone() {
            return Ok(ctx);
        }
        let ctx = build_context(&entries)?;
        *self.context.write() = Some(ctx.clone());
        Ok(ctx)
    }

    async fn try_acquire(&self, url: &str) -> Result<usize> {
        let parsed =
            Url::parse(url).map_err(|e| Error::Config(format!("Invalid URL '{url}': {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::Config(format!("URL '{url}' has no host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = parsed.port().unwrap_or(443);
        let proxy = proxy::resolve(self.proxy.as_deref(), &host);

        // Held for the whole acquisition so concurrent refreshes serialize
        let mut entries = self.entries.lock().await;

        let chain = acquire::fetch_chain(&host, port, proxy.as_ref(), self.connect_timeout).await?;

        let mut next = entries.clone();
        next.retain(|alias, _| !is_host_alias(alias, &host));
        let now = Utc::now();
        for (i, cert) in chain.iter().enumerate() {
            let alias = format!("{host}_{i}");
            next.insert(
                alias.clone(),
                TrustedCertificateEntry {
                    alias,
                    certificate: cert.to_vec(),
                    acquired_at: now,
                },
            );
        }

        save_file(&self.path, &next)?;
        let ctx = build_context(&next)?;

        *entries = next;
        *self.context.write() = Some(ctx);
        Ok(chain.len())
    }
}

fn is_host_alias(alias: &str, host: &str) -> bool {
    alias
        .strip_prefix(host)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
}

fn build_context(entries: &BTreeMap<String, TrustedCertificateEntry>) -> Result<TlsContext> {
    let pinned: Vec<CertificateDer<'static>> = entries
        .values()
        .map(|e| CertificateDer::from(e.certificate.clone()))
        .collect();
    TlsContext::with_pinned(&pinned)
}

fn compute_mac(entries: &[TrustedCertificateEntry]) -> Result<String> {
    use hmac::{KeyInit, Mac};

    let mut mac = hmac::Hmac::<Sha256>::new_from_slice(STORE_PASSWORD)
        .map_err(|e| Error::Internal(format!("Invalid trust store key: {e}")))?;
    mac.update(&serde_json::to_vec(entries)?);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn load_file(path: &Path) -> BTreeMap<String, TrustedCertificateEntry> {
    if !path.exists() {
        debug!(path = %path.display(), "No trust store yet");
        return BTreeMap::new();
    }

    match read_file(path) {
        Ok(entries) => {
            info!(path = %path.display(), certificates = entries.len(), "Loaded trust store");
            entries
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Trust store unusable, starting empty");
            BTreeMap::new()
        }
    }
}

fn read_file(path: &Path) -> Result<BTreeMap<String, TrustedCertificateEntry>> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Persistence(format!("Failed to read {}: {e}", path.display())))?;
    let file: TrustStoreFile = serde_json::from_str(&content)
        .map_err(|e| Error::Persistence(format!("Corrupt trust store: {e}")))?;

    if file.version != FILE_VERSION {
        return Err(Error::Persistence(format!(
            "Unsupported trust store version {}",
            file.version
        )));
    }
    if compute_mac(&file.entries)? != file.mac {
        return Err(Error::Persistence("Trust store integrity check failed".to_string()));
    }

    Ok(file
        .entries
        .into_iter()
        .map(|e| (e.alias.clone(), e))
        .collect())
}

fn save_file(path: &Path, entries: &BTreeMap<String, TrustedCertificateEntry>) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| {
            Error::Persistence(format!("Failed to create {}: {e}", dir.display()))
        })?;
    }

    let entries: Vec<TrustedCertificateEntry> = entries.values().cloned().collect();
    let file = TrustStoreFile {
        version: FILE_VERSION,
        mac: compute_mac(&entries)?,
        entries,
    };

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(&file)?)
        .map_err(|e| Error::Persistence(format!("Failed to write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::Persistence(format!("Failed to replace {}: {e}", path.display())))
}

mod der_base64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
