//! HTTP CONNECT proxy selection and tunnelling.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::{Error, Result};

/// Port assumed when a proxy URL does not name one
pub const DEFAULT_PROXY_PORT: u16 = 8080;

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Proxy endpoint used to reach a target host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
}

/// Select the proxy for `target_host` from `explicit` or the process environment
#[must_use]
pub fn resolve(explicit: Option<&str>, target_host: &str) -> Option<ProxyTarget> {
    resolve_with(explicit, target_host, |name| std::env::var(name).ok())
}

/// Proxy selection with an injectable environment lookup
pub fn resolve_with<F>(explicit: Option<&str>, target_host: &str, env: F) -> Option<ProxyTarget>
where
    F: Fn(&str) -> Option<String>,
{
    // An explicitly configured proxy is always used; NO_PROXY only filters the environment
    if let Some(value) = explicit.filter(|v| !v.trim().is_empty()) {
        return parse_proxy(value);
    }

    let configured = ["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"]
        .iter()
        .find_map(|name| env(name))
        .filter(|v| !v.trim().is_empty())?;

    let no_proxy = env("NO_PROXY").or_else(|| env("no_proxy")).unwrap_or_default();
    if is_loopback(target_host) || bypasses(&no_proxy, target_host) {
        debug!(host = %target_host, "Proxy bypassed by NO_PROXY");
        return None;
    }

    parse_proxy(&configured)
}

fn parse_proxy(value: &str) -> Option<ProxyTarget> {
    let value = value.trim();
    let with_scheme = if value.contains("://") {
        value.to_string()
    } else {
        format!("http://{value}")
    };
    let url = Url::parse(&with_scheme).ok()?;
    let host = url.host_str()?.to_string();
    // Url drops a port equal to the scheme default, so read it from the raw text
    let port = url.port().or_else(|| explicit_port(&with_scheme));
    Some(ProxyTarget {
        host,
        port: port.unwrap_or(DEFAULT_PROXY_PORT),
    })
}

/// Port written in the authority of `url`, even when it equals the scheme default
fn explicit_port(url: &str) -> Option<u16> {
    let (_, rest) = url.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    let port = match host_port.rsplit_once(']') {
        Some((_, after_ipv6)) => after_ipv6.strip_prefix(':')?,
        None => host_port.rsplit_once(':')?.1,
    };
    port.parse().ok()
}

fn is_loopback(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<std::net::IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

fn bypasses(no_proxy: &str, host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    no_proxy
        .split(',')
        .map(|entry| entry.trim().to_ascii_lowercase())
        .filter(|entry| !entry.is_empty())
        .any(|entry| {
            if entry == "*" {
                return true;
            }
            let entry = entry.split(':').next().unwrap_or_default();
            let domain = entry.trim_start_matches('.');
            host == domain || host.ends_with(&format!(".{domain}"))
        })
}

/// Ask the proxy on `stream` to open a tunnel to `host:port`.
///
/// The response head is consumed byte by byte so no TLS bytes are swallowed.
pub async fn open_tunnel(stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
    let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| Error::Transport(format!("Proxy write failed: {e}")))?;

    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(Error::Transport("Proxy response head too large".to_string()));
        }
        let byte = stream
            .read_u8()
            .await
            .map_err(|e| Error::Transport(format!("Proxy closed the connection: {e}")))?;
        head.push(byte);
    }

    let text = String::from_utf8_lossy(&head);
    let status_line = text.lines().next().unwrap_or_default();
    if status_line.split_whitespace().nth(1) != Some("200") {
        return Err(Error::Transport(format!(
            "Proxy refused CONNECT to {host}:{port}: {status_line}"
        )));
    }

    debug!(host = %host, port, "Proxy tunnel established");
    Ok(())
}
