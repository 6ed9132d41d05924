//! TLS trust for the identity provider.
//!
//! [`CertificateTrustStore`] captures the provider's chain on first contact
//! (trust on first use), persists it, and builds a [`TlsContext`] combining
//! the system CA bundle with the pinned certificates. Every HTTPS client that
//! talks to the provider is built from that context.

mod acquire;
pub mod context;
pub mod proxy;
mod store;

pub use acquire::describe;
pub use context::{TlsContext, install_process_default, process_default};
pub use proxy::ProxyTarget;
pub use store::{CertificateTrustStore, DEFAULT_ACQUIRE_TIMEOUT, TrustedCertificateEntry};
