//! Registration state and status events

use super::shared::events::DomainEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason attached to an `idle` transition caused by incomplete configuration
pub const REASON_MISSING_CREDENTIALS: &str = "missing-credentials";
/// Reason attached to an `idle` transition caused by `stop()`
pub const REASON_STOPPED: &str = "stopped";

/// Connection state of the softphone identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Registering,
    Registered,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Registering => "registering",
            ConnectionState::Registered => "registered",
            ConnectionState::Error => "error",
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Idle
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cause and status code carried by a transition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl StatusMeta {
    pub fn cause(cause: impl Into<String>) -> Self {
        Self {
            cause: Some(cause.into()),
            status_code: None,
        }
    }

    pub fn with_status(cause: impl Into<String>, status_code: u16) -> Self {
        Self {
            cause: Some(cause.into()),
            status_code: Some(status_code),
        }
    }
}

/// Broadcast on every state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<StatusMeta>,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(state: ConnectionState, meta: Option<StatusMeta>) -> Self {
        Self {
            state,
            meta,
            timestamp: Utc::now(),
        }
    }

    pub fn cause(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|meta| meta.cause.as_deref())
    }

    pub fn status_code(&self) -> Option<u16> {
        self.meta.as_ref().and_then(|meta| meta.status_code)
    }
}

impl DomainEvent for StatusEvent {
    fn event_type(&self) -> &'static str {
        "sip.status"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Authentication context kept between REGISTER attempts.
///
/// Created on the first challenge and discarded by `stop()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSession {
    realm: String,
}

impl RegistrationSession {
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }
}
