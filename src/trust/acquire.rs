//! Trust-on-first-use chain capture.
//!
//! Performs a TLS handshake whose verifier accepts any chain and records what
//! the server presented. The captured chain is never used to carry data.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use x509_parser::prelude::{FromDer, X509Certificate};

use super::context::crypto_provider;
use super::proxy::{self, ProxyTarget};
use crate::{Error, Result};

/// Records the presented chain and accepts it
#[derive(Debug)]
struct CapturingVerifier {
    chain: Arc<Mutex<Vec<CertificateDer<'static>>>>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let mut chain = self.chain.lock();
        chain.clear();
        chain.push(end_entity.clone().into_owned());
        chain.extend(intermediates.iter().map(|c| c.clone().into_owned()));
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Connect to `host:port` (through `proxy` when given) and return the
/// certificate chain the server presents, leaf first.
pub(crate) async fn fetch_chain(
    host: &str,
    port: u16,
    proxy: Option<&ProxyTarget>,
    connect_timeout: Duration,
) -> Result<Vec<CertificateDer<'static>>> {
    let stream = match proxy {
        Some(p) => {
            debug!(proxy = %p.host, port = p.port, "Connecting through proxy");
            let mut s = connect(&p.host, p.port, connect_timeout).await?;
            timeout(connect_timeout, proxy::open_tunnel(&mut s, host, port))
                .await
                .map_err(|_| Error::Transport(format!("Proxy tunnel to {host}:{port} timed out")))??;
            s
        }
        None => connect(host, port, connect_timeout).await?,
    };

    let provider = crypto_provider();
    let chain = Arc::new(Mutex::new(Vec::new()));
    let verifier = CapturingVerifier {
        chain: Arc::clone(&chain),
        algorithms: provider.signature_verification_algorithms,
    };
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Internal(format!("TLS protocol setup failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::Transport(format!("Invalid server name '{host}': {e}")))?;

    let connector = TlsConnector::from(Arc::new(config));
    let mut tls = timeout(connect_timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| Error::Transport(format!("TLS handshake with {host}:{port} timed out")))?
        .map_err(|e| Error::Transport(format!("TLS handshake with {host}:{port} failed: {e}")))?;

    let _ = tls.shutdown().await;

    let captured = std::mem::take(&mut *chain.lock());
    if captured.is_empty() {
        return Err(Error::Transport(format!("{host}:{port} presented no certificates")));
    }

    for (i, cert) in captured.iter().enumerate() {
        info!(host = %host, index = i, "{}", describe(cert));
    }
    Ok(captured)
}

async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
    timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| Error::Transport(format!("Connection to {host}:{port} timed out")))?
        .map_err(|e| Error::Transport(format!("Connection to {host}:{port} failed: {e}")))
}

/// One-line subject/issuer/expiry summary for logs and listings
#[must_use]
pub fn describe(der: &[u8]) -> String {
    match X509Certificate::from_der(der) {
        Ok((_, cert)) => format!(
            "subject={} issuer={} not_after={}",
            cert.subject(),
            cert.issuer(),
            cert.validity().not_after
        ),
        Err(_) => format!("unparsable certificate ({} bytes)", der.len()),
    }
}
