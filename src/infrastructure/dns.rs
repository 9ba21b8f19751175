//! Registrar reachability probing
//!
//! A bounded DNS lookup of the registrar host, done before every
//! registration attempt.

use crate::domain::shared::split_host_port;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Port used when the server string carries none
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// Schemes that may prefix a configured server address
const KNOWN_SCHEMES: [&str; 7] = ["sips://", "sip://", "udp://", "tcp://", "tls://", "sips:", "sip:"];

/// Host name resolution
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.collect())
    }
}

/// Registrar host and port after stripping any scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrarAddress {
    pub hostname: String,
    pub port: u16,
}

impl RegistrarAddress {
    /// Parse a server string such as `sip:pbx.example.com:5080`.
    ///
    /// `port_override` wins over a port embedded in the string.
    pub fn parse(server: &str, port_override: Option<u16>) -> Option<Self> {
        let mut rest = server.trim();
        for scheme in KNOWN_SCHEMES {
            let matches = rest
                .get(..scheme.len())
                .map(|prefix| prefix.eq_ignore_ascii_case(scheme))
                .unwrap_or(false);
            if matches {
                rest = &rest[scheme.len()..];
                break;
            }
        }

        // Drop user info, parameters and any trailing path
        let rest = rest.rsplit_once('@').map(|(_, host)| host).unwrap_or(rest);
        let rest = rest.split([';', '/', '?']).next().unwrap_or_default();

        let (hostname, port) = split_host_port(rest)?;
        Some(Self {
            hostname,
            port: port_override.or(port).unwrap_or(DEFAULT_SIP_PORT),
        })
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub reachable: bool,
    pub hostname: String,
    pub port: u16,
    /// Resolved addresses, empty when unreachable
    pub addresses: Vec<SocketAddr>,
    pub error: Option<String>,
}

impl ProbeResult {
    fn unreachable(address: &RegistrarAddress, error: String) -> Self {
        Self {
            reachable: false,
            hostname: address.hostname.clone(),
            port: address.port,
            addresses: Vec::new(),
            error: Some(error),
        }
    }
}

/// Resolve the registrar host, giving up after `timeout`
pub async fn probe(resolver: &dyn Resolver, address: &RegistrarAddress, timeout: Duration) -> ProbeResult {
    debug!("Resolving {}:{}", address.hostname, address.port);

    let lookup = resolver.resolve(&address.hostname, address.port);
    match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(addresses)) if !addresses.is_empty() => {
            debug!("{} resolved to {:?}", address.hostname, addresses);
            ProbeResult {
                reachable: true,
                hostname: address.hostname.clone(),
                port: address.port,
                addresses,
                error: None,
            }
        }
        Ok(Ok(_)) => {
            warn!("DNS lookup for {} returned no addresses", address.hostname);
            ProbeResult::unreachable(
                address,
                format!("Server {} is not reachable: no addresses found", address.hostname),
            )
        }
        Ok(Err(e)) => {
            warn!("DNS lookup for {} failed: {}", address.hostname, e);
            ProbeResult::unreachable(
                address,
                format!("Server {} is not reachable: {}", address.hostname, e),
            )
        }
        Err(_) => {
            warn!("DNS lookup for {} timed out after {:?}", address.hostname, timeout);
            ProbeResult::unreachable(
                address,
                format!(
                    "Server {} is not reachable: DNS lookup timed out after {}s",
                    address.hostname,
                    timeout.as_secs()
                ),
            )
        }
    }
}
