//! Configuration management

use crate::domain::shared::{split_host_port, DomainError, SipUri, UriScheme};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Prefix of environment overrides, e.g. `SIPWATCH__ACCOUNT__PASSWORD`
pub const ENV_PREFIX: &str = "SIPWATCH";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub account: SipAccountConfig,
    #[serde(default)]
    pub timers: TimerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

/// Wire transport used to reach the registrar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }

    /// `sips` only when the signaling is TLS protected
    pub fn scheme(&self) -> UriScheme {
        match self {
            TransportKind::Tls => UriScheme::Sips,
            TransportKind::Udp | TransportKind::Tcp => UriScheme::Sip,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The SIP account being watched. Immutable for one `start()` cycle.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SipAccountConfig {
    /// Registrar address, optionally with a scheme prefix and `:port`
    pub server: String,
    /// Overrides a port embedded in `server`
    pub port: Option<u16>,
    pub transport: TransportKind,
    /// Domain of the identity; the registrar host is used when absent
    pub domain: Option<String>,
    pub username: String,
    pub password: String,
    /// Full identity URI, overriding the derived one
    pub uri: Option<String>,
    pub display_name: Option<String>,
}

impl SipAccountConfig {
    pub fn new(
        server: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.validate().is_ok()
    }

    /// Registration requires server, username and password
    pub fn validate(&self) -> Result<(), DomainError> {
        let missing: Vec<&str> = [
            ("server", &self.server),
            ("username", &self.username),
            ("password", &self.password),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(DomainError::MissingCredentials(missing.join(", ")))
        }
    }

    pub fn scheme(&self) -> UriScheme {
        self.transport.scheme()
    }

    /// Identity URI: `scheme:username@(domain ?? registrar host)`, unless
    /// `uri` names one explicitly
    pub fn identity_uri(&self, registrar_host: &str) -> Result<SipUri, DomainError> {
        if let Some(uri) = self.uri.as_deref().map(str::trim).filter(|uri| !uri.is_empty()) {
            return SipUri::parse(uri);
        }

        let domain = self
            .domain
            .as_deref()
            .map(str::trim)
            .filter(|domain| !domain.is_empty())
            .unwrap_or(registrar_host);
        let (host, port) = split_host_port(domain)
            .ok_or_else(|| DomainError::InvalidUri(format!("Invalid domain: {}", domain)))?;

        Ok(SipUri::new(
            self.scheme(),
            Some(self.username.trim().to_string()),
            host,
            port,
        ))
    }
}

impl fmt::Debug for SipAccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SipAccountConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("transport", &self.transport)
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("uri", &self.uri)
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// Timing knobs of the signaling core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub settle_delay_ms: u64,
    pub dns_timeout_secs: u64,
    pub connection_timeout_secs: u64,
    pub busy_delay_ms: u64,
    pub register_expires_secs: u32,
    pub min_reregister_secs: u64,
    pub reconnect_initial_secs: u64,
    pub reconnect_max_secs: u64,
    pub reconnect_max_attempts: u32,
    pub health_check_secs: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            dns_timeout_secs: 3,
            connection_timeout_secs: 15,
            busy_delay_ms: 1000,
            register_expires_secs: 3600,
            min_reregister_secs: 30,
            reconnect_initial_secs: 5,
            reconnect_max_secs: 30,
            reconnect_max_attempts: 3,
            health_check_secs: 30,
        }
    }
}

impl TimerConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn busy_delay(&self) -> Duration {
        Duration::from_millis(self.busy_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
