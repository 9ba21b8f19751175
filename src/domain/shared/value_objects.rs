//! Shared value objects used across the signaling core

use super::error::DomainError;
use super::result::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// URI scheme of a SIP address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UriScheme {
    Sip,
    Sips,
}

impl UriScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            UriScheme::Sip => "sip",
            UriScheme::Sips => "sips",
        }
    }
}

impl fmt::Display for UriScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SIP URI value object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    scheme: UriScheme,
    user: Option<String>,
    host: String,
    port: Option<u16>,
}

impl SipUri {
    pub fn new(scheme: UriScheme, user: Option<String>, host: String, port: Option<u16>) -> Self {
        Self {
            scheme,
            user,
            host,
            port,
        }
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        let (scheme, rest) = if let Some(rest) = uri.strip_prefix("sips:") {
            (UriScheme::Sips, rest)
        } else if let Some(rest) = uri.strip_prefix("sip:") {
            (UriScheme::Sip, rest)
        } else {
            return Err(DomainError::InvalidUri(format!(
                "URI must start with 'sip:' or 'sips:': {}",
                uri
            )));
        };

        // Parameters and headers are not part of the address
        let rest = rest.split([';', '?']).next().unwrap_or_default();

        let (user, host_port) = match rest.rsplit_once('@') {
            Some((user, host_port)) if !user.is_empty() => (Some(user.to_string()), host_port),
            Some((_, host_port)) => (None, host_port),
            None => (None, rest),
        };

        let (host, port) = split_host_port(host_port)
            .ok_or_else(|| DomainError::InvalidUri(format!("Invalid SIP URI format: {}", uri)))?;

        Ok(Self {
            scheme,
            user,
            host,
            port,
        })
    }

    pub fn scheme(&self) -> UriScheme {
        self.scheme
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
///
/// Returns `None` for an empty host or a non-numeric port.
pub fn split_host_port(input: &str) -> Option<(String, Option<u16>)> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        if host.is_empty() {
            return None;
        }
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(port.parse().ok()?),
            None if tail.is_empty() => None,
            None => return None,
        };
        return Some((host.to_string(), port));
    }

    match input.rsplit_once(':') {
        // A bare IPv6 literal has more than one colon and no port
        Some((host, _)) if host.contains(':') => Some((input.to_string(), None)),
        Some((host, port)) => {
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), Some(port.parse().ok()?)))
        }
        None => Some((input.to_string(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sip_uri_parse() {
        let uri = SipUri::parse("sip:alice@example.com").unwrap();
        assert_eq!(uri.scheme(), UriScheme::Sip);
        assert_eq!(uri.user(), Some("alice"));
        assert_eq!(uri.host(), "example.com");
        assert_eq!(uri.port(), None);

        let uri_with_port = SipUri::parse("sips:bob@example.com:5061;transport=tls").unwrap();
        assert_eq!(uri_with_port.scheme(), UriScheme::Sips);
        assert_eq!(uri_with_port.user(), Some("bob"));
        assert_eq!(uri_with_port.host(), "example.com");
        assert_eq!(uri_with_port.port(), Some(5061));
    }

    #[test]
    fn test_sip_uri_rejects_other_schemes() {
        assert!(SipUri::parse("tel:+15551234567").is_err());
        assert!(SipUri::parse("sip:alice@").is_err());
    }

    #[test]
    fn test_sip_uri_display() {
        let uri = SipUri::new(
            UriScheme::Sip,
            Some("alice".to_string()),
            "example.com".to_string(),
            None,
        );
        assert_eq!(uri.to_string(), "sip:alice@example.com");

        let registrar = SipUri::new(UriScheme::Sips, None, "example.com".to_string(), Some(5061));
        assert_eq!(registrar.to_string(), "sips:example.com:5061");
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("sip.example.com:5080"),
            Some(("sip.example.com".to_string(), Some(5080)))
        );
        assert_eq!(
            split_host_port("sip.example.com"),
            Some(("sip.example.com".to_string(), None))
        );
        assert_eq!(split_host_port("[::1]:5060"), Some(("::1".to_string(), Some(5060))));
        assert_eq!(split_host_port("::1"), Some(("::1".to_string(), None)));
        assert_eq!(split_host_port("host:abc"), None);
        assert_eq!(split_host_port(""), None);
    }
}
