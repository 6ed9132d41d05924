//! Trust-on-first-use pinning against local TLS servers

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::closed_port;
use controlroom_auth::http::build_http_client;
use controlroom_auth::trust::{CertificateTrustStore, TlsContext};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// Self-signed HTTPS server answering every request with `ok`
struct TlsServer {
    addr: SocketAddr,
    cert: CertificateDer<'static>,
}

impl TlsServer {
    async fn start() -> Self {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));

        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(mut tls) = acceptor.accept(stream).await else {
                        return;
                    };
                    if read_head(&mut tls).await.is_some() {
                        let _ = tls
                            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                            .await;
                        let _ = tls.shutdown().await;
                    }
                });
            }
        });

        Self {
            addr,
            cert: cert_der,
        }
    }

    fn url(&self) -> String {
        format!("https://localhost:{}", self.addr.port())
    }
}

async fn read_head<S: AsyncReadExt + Unpin>(stream: &mut S) -> Option<String> {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await.ok()?);
    }
    Some(String::from_utf8_lossy(&head).into_owned())
}

/// HTTP CONNECT proxy that records request lines and tunnels to `target`
async fn start_proxy(target: SocketAddr, status: u16) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let recorded = Arc::clone(&seen);
    tokio::spawn(async move {
        loop {
            let Ok((mut client, _)) = listener.accept().await else {
                return;
            };
            let recorded = Arc::clone(&recorded);
            tokio::spawn(async move {
                let Some(head) = read_head(&mut client).await else {
                    return;
                };
                recorded
                    .lock()
                    .push(head.lines().next().unwrap_or_default().to_string());
                if status != 200 {
                    let _ = client
                        .write_all(format!("HTTP/1.1 {status} Forbidden\r\n\r\n").as_bytes())
                        .await;
                    return;
                }
                let Ok(mut upstream) = TcpStream::connect(target).await else {
                    return;
                };
                let _ = client
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await;
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            });
        }
    });
    (addr, seen)
}

fn store_in(dir: &TempDir, proxy: Option<String>) -> CertificateTrustStore {
    CertificateTrustStore::open(dir.path().join("oidc_truststore.json"), None, proxy)
        .with_connect_timeout(Duration::from_secs(5))
}

async fn fetch_ok(tls: &TlsContext, url: &str) -> bool {
    let client = build_http_client(tls, Some(Duration::from_secs(5))).unwrap();
    match client.get(url).send().await {
        Ok(response) => response.text().await.is_ok_and(|body| body == "ok"),
        Err(_) => false,
    }
}

#[tokio::test]
async fn test_acquired_certificate_is_trusted_after_reopen() {
    // GIVEN: a self-signed server the system roots do not trust
    let server = TlsServer::start().await;
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, None);
    assert!(!fetch_ok(&TlsContext::system_roots().unwrap(), &server.url()).await);

    // WHEN: its chain is pinned
    assert!(store.acquire_certificates(&server.url()).await);

    // THEN: it is stored under host_index and survives a reopen
    let entries = store.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].alias, "localhost_0");
    assert_eq!(entries[0].certificate, server.cert.to_vec());
    assert_eq!(store.last_connection_error(), None);

    let reopened = store_in(&dir, None);
    assert_eq!(reopened.entries().await.len(), 1);
    let tls = reopened.tls_context().await.unwrap();
    assert_eq!(tls.pinned_count(), 1);
    assert!(fetch_ok(&tls, &server.url()).await);
}

#[tokio::test]
async fn test_unreachable_host_reports_error() {
    let port = closed_port().await;
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, None);

    assert!(!store.acquire_certificates(&format!("https://localhost:{port}")).await);

    assert!(store.last_connection_error().is_some());
    assert!(store.entries().await.is_empty());
    assert!(!dir.path().join("oidc_truststore.json").exists());
}

#[tokio::test]
async fn test_plain_http_server_is_not_pinned() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        }
    });
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, None);

    assert!(!store.acquire_certificates(&format!("https://127.0.0.1:{port}")).await);
    assert!(store.entries().await.is_empty());
}

#[tokio::test]
async fn test_reacquire_replaces_only_same_host() {
    // GIVEN: the same server pinned under two host names
    let first = TlsServer::start().await;
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, None);
    assert!(store.acquire_certificates(&first.url()).await);
    let by_ip = format!("https://127.0.0.1:{}", first.addr.port());
    assert!(store.acquire_certificates(&by_ip).await);

    // WHEN: localhost now serves a different certificate
    let second = TlsServer::start().await;
    assert!(store.acquire_certificates(&second.url()).await);

    // THEN: localhost's entry is replaced and 127.0.0.1's is kept
    let entries = store.entries().await;
    let aliases: Vec<&str> = entries.iter().map(|e| e.alias.as_str()).collect();
    assert_eq!(aliases, vec!["127.0.0.1_0", "localhost_0"]);
    assert_eq!(entries[0].certificate, first.cert.to_vec());
    assert_eq!(entries[1].certificate, second.cert.to_vec());
}

#[tokio::test]
async fn test_acquire_through_connect_proxy() {
    let server = TlsServer::start().await;
    let (proxy, seen) = start_proxy(server.addr, 200).await;
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, Some(format!("http://{proxy}")));

    assert!(store.acquire_certificates(&server.url()).await);

    assert_eq!(
        seen.lock().clone(),
        vec![format!("CONNECT localhost:{} HTTP/1.1", server.addr.port())]
    );
    assert_eq!(store.entries().await[0].certificate, server.cert.to_vec());
}

#[tokio::test]
async fn test_refused_tunnel_fails_acquisition() {
    let server = TlsServer::start().await;
    let (proxy, _) = start_proxy(server.addr, 403).await;
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, Some(format!("http://{proxy}")));

    assert!(!store.acquire_certificates(&server.url()).await);
    assert!(store.last_connection_error().unwrap().contains("403"));
}

#[tokio::test]
async fn test_tampered_file_is_ignored() {
    let server = TlsServer::start().await;
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, None);
    assert!(store.acquire_certificates(&server.url()).await);

    let path = dir.path().join("oidc_truststore.json");
    let content = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, content.replace("localhost_0", "evil_0")).unwrap();

    assert!(store_in(&dir, None).entries().await.is_empty());
}

#[tokio::test]
async fn test_refresh_without_provider_url_fails() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, None);

    assert!(!store.refresh_certificates().await);
    assert!(store.last_connection_error().is_some());
}

#[tokio::test]
async fn test_tls_context_acquires_on_first_use() {
    let server = TlsServer::start().await;
    let dir = TempDir::new().unwrap();
    let store = CertificateTrustStore::open(
        dir.path().join("oidc_truststore.json"),
        Some(server.url()),
        None,
    );

    let tls = store.tls_context().await.unwrap();

    assert_eq!(tls.pinned_count(), 1);
    assert!(fetch_ok(&tls, &server.url()).await);
}
