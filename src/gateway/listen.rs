//! Parsing and resolving the gateway's listen address.

use std::fmt;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use url::Url;

/// A listen address before name resolution.
///
/// Written either as `host:port` or as a `ws://` / `wss://` URL, where the
/// port defaults to the scheme's. `host` keeps IPv6 brackets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenTarget {
    pub host: String,
    pub port: u16,
}

impl ListenTarget {
    pub fn parse(listen: &str) -> Result<Self> {
        let listen = listen.trim();
        if listen.starts_with("ws://") || listen.starts_with("wss://") {
            let url = Url::parse(listen)
                .with_context(|| format!("Invalid WebSocket URL {listen}"))?;
            let host = url
                .host_str()
                .with_context(|| format!("{listen} has no host"))?;
            let port = url
                .port_or_known_default()
                .with_context(|| format!("{listen} has no port"))?;
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }

        let (host, port) = listen
            .rsplit_once(':')
            .with_context(|| format!("Listen address {listen} needs a port"))?;
        if host.is_empty() {
            anyhow::bail!("Listen address {listen} needs a host");
        }
        let port = port
            .parse()
            .with_context(|| format!("Invalid port in listen address {listen}"))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// First socket address the host resolves to.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host(self.to_string())
            .await
            .with_context(|| format!("Cannot resolve {self}"))?
            .next()
            .with_context(|| format!("{self} resolved to no addresses"))
    }
}

impl fmt::Display for ListenTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub async fn resolve_listen_addr(listen: &str) -> Result<SocketAddr> {
    ListenTarget::parse(listen)?.resolve().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_address_passes_through() {
        let addr = resolve_listen_addr(" 127.0.0.1:9001 ").await.unwrap();
        assert_eq!(addr, "127.0.0.1:9001".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn websocket_url_uses_scheme_port() {
        let addr = resolve_listen_addr("ws://127.0.0.1").await.unwrap();
        assert_eq!(addr.port(), 80);
        let target = ListenTarget::parse("wss://127.0.0.1").unwrap();
        assert_eq!(target.port, 443);
    }

    #[tokio::test]
    async fn hostnames_are_resolved() {
        let addr = resolve_listen_addr("ws://localhost:9001").await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 9001);

        let addr = resolve_listen_addr("localhost:9002").await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 9002);
    }

    #[test]
    fn ipv6_keeps_brackets() {
        let target = ListenTarget::parse("[::1]:7000").unwrap();
        assert_eq!(target.host, "[::1]");
        assert_eq!(target.port, 7000);
        assert_eq!(target.to_string(), "[::1]:7000");
    }

    #[test]
    fn rejects_addresses_without_a_usable_port_or_host() {
        assert!(ListenTarget::parse("nowhere").is_err());
        assert!(ListenTarget::parse("localhost:http").is_err());
        assert!(ListenTarget::parse(":9001").is_err());
        assert!(ListenTarget::parse("ws://").is_err());
    }
}
