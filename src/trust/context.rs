//! Composite TLS trust: the system CA bundle plus pinned identity-provider
//! certificates.
//!
//! The system bundle comes from the platform verifier. When the platform has
//! no usable roots the bundled webpki roots stand in.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use rustls_platform_verifier::Verifier;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Immutable client TLS configuration handed to every HTTPS client
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
    pinned: usize,
}

impl TlsContext {
    /// Trust only the system CA bundle
    pub fn system_roots() -> Result<Self> {
        Self::with_pinned(&[])
    }

    /// Trust the system CA bundle and every certificate in `pinned`.
    ///
    /// Certificates that cannot act as trust anchors are skipped with a warning.
    pub fn with_pinned(pinned: &[CertificateDer<'static>]) -> Result<Self> {
        let anchors: Vec<CertificateDer<'static>> = pinned
            .iter()
            .filter(|cert| match RootCertStore::empty().add((*cert).clone()) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Skipping pinned certificate that is not a usable trust anchor");
                    false
                }
            })
            .cloned()
            .collect();
        let added = anchors.len();

        let builder = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Internal(format!("TLS protocol setup failed: {e}")))?;

        let verifier = Verifier::new_with_extra_roots(anchors.clone(), crypto_provider());
        let mut config = match verifier {
            Ok(verifier) => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier))
                .with_no_client_auth(),
            Err(e) => {
                warn!(error = %e, "System CA bundle unavailable, using bundled webpki roots");
                let mut roots = RootCertStore {
                    roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
                };
                roots.add_parsable_certificates(anchors);
                builder.with_root_certificates(roots).with_no_client_auth()
            }
        };
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        debug!(pinned = added, "Built composite TLS context");
        Ok(Self {
            config: Arc::new(config),
            pinned: added,
        })
    }

    /// Shared rustls client configuration
    #[must_use]
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    /// Number of pinned certificates accepted as trust anchors
    #[must_use]
    pub fn pinned_count(&self) -> usize {
        self.pinned
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("pinned", &self.pinned)
            .finish_non_exhaustive()
    }
}

pub(crate) fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

static PROCESS_DEFAULT: RwLock<Option<TlsContext>> = parking_lot::const_rwlock(None);

/// Publish `context` for components that cannot be handed one explicitly
pub fn install_process_default(context: TlsContext) {
    debug!(pinned = context.pinned_count(), "Installed process-default TLS context");
    *PROCESS_DEFAULT.write() = Some(context);
}

/// The context last passed to [`install_process_default`]
#[must_use]
pub fn process_default() -> Option<TlsContext> {
    PROCESS_DEFAULT.read().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_roots_have_no_pins() {
        let ctx = TlsContext::system_roots().unwrap();
        assert_eq!(ctx.pinned_count(), 0);
        assert_eq!(ctx.client_config().alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn garbage_pin_is_skipped() {
        let junk = CertificateDer::from(vec![0x30, 0x03, 0x01, 0x01, 0x00]);
        let ctx = TlsContext::with_pinned(&[junk]).unwrap();
        assert_eq!(ctx.pinned_count(), 0);
    }

    #[test]
    fn usable_pin_is_counted_next_to_garbage() {
        let cert = rcgen::generate_simple_self_signed(vec!["idp.local".to_string()]).unwrap();
        let junk = CertificateDer::from(vec![0x30, 0x03, 0x01, 0x01, 0x00]);

        let ctx = TlsContext::with_pinned(&[cert.cert.der().clone(), junk]).unwrap();

        assert_eq!(ctx.pinned_count(), 1);
        assert_eq!(ctx.client_config().alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn process_default_round_trip() {
        let ctx = TlsContext::system_roots().unwrap();
        install_process_default(ctx);
        assert!(process_default().is_some());
    }
}
