//! Caller-ID extraction for incoming INVITEs

use super::shared::events::DomainEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller information handed to the notification layer, once per INVITE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub display_name: String,
    pub number: String,
    /// Digits only
    pub normalized_number: String,
    pub timestamp: DateTime<Utc>,
}

impl IncomingCall {
    /// Build the event from the value of a `From` header.
    ///
    /// Returns `None` when the header carries no URI.
    pub fn from_header_value(from: &str) -> Option<Self> {
        let caller = CallerId::parse(from)?;
        let normalized_number = normalize_number(&caller.number);
        let display_name = caller.display_name.unwrap_or_else(|| caller.number.clone());

        Some(Self {
            display_name,
            number: caller.number,
            normalized_number,
            timestamp: Utc::now(),
        })
    }
}

impl DomainEvent for IncomingCall {
    fn event_type(&self) -> &'static str {
        "sip.incoming_call"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Display name and number parsed out of a name-addr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId {
    pub display_name: Option<String>,
    pub number: String,
}

impl CallerId {
    /// Parse `"Jane Doe" <sip:+15551234567@host>;tag=x` and its variants
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();

        let (display_name, uri) = match value.find('<') {
            Some(open) => {
                let close = value[open..].find('>')? + open;
                let name = value[..open].trim().trim_matches('"').trim();
                let name = (!name.is_empty()).then(|| name.to_string());
                (name, value[open + 1..close].trim())
            }
            // addr-spec form: parameters belong to the header
            None => (None, value.split(';').next().unwrap_or_default().trim()),
        };

        let number = user_part(uri)?;
        Some(Self {
            display_name,
            number,
        })
    }
}

fn user_part(uri: &str) -> Option<String> {
    let (scheme, rest) = uri.split_once(':')?;
    let user = match scheme.to_ascii_lowercase().as_str() {
        "sip" | "sips" => {
            let rest = rest.split([';', '?']).next().unwrap_or_default();
            match rest.split_once('@') {
                Some((user, _)) => user,
                None => rest,
            }
        }
        "tel" => rest.split(';').next().unwrap_or_default(),
        _ => return None,
    };

    // Strip user-part parameters such as `;phone-context`
    let user = user.split(';').next().unwrap_or_default().trim();
    (!user.is_empty()).then(|| user.to_string())
}

/// Keep only ASCII digits
pub fn normalize_number(number: &str) -> String {
    number.chars().filter(|c| c.is_ascii_digit()).collect()
}
