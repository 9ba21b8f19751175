//! REGISTER client
//!
//! Drives one REGISTER exchange to a verdict, answering at most one Digest
//! challenge on the way.

use super::auth::{DigestAuthenticator, UserCredentials};
use super::builder::{build_register_request, RegisterParams};
use super::message::{SipError, SipRequest, SipResponse};
use super::transport::Transport;
use crate::config::SipAccountConfig;
use crate::domain::registration::{RegistrationSession, StatusMeta};
use crate::domain::shared::{DomainError, SipUri};
use crate::infrastructure::dns::RegistrarAddress;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How a REGISTER exchange ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationVerdict {
    /// 2xx; `expires` is what the registrar granted
    Registered { expires: u32 },
    /// Fatal for this attempt
    Failed(StatusMeta),
    /// Nothing was sent because the transport is gone
    TransportInactive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationOutcome {
    /// Realm of the challenge answered during the exchange
    pub realm: Option<String>,
    pub verdict: RegistrationVerdict,
}

impl RegistrationOutcome {
    fn new(realm: Option<String>, verdict: RegistrationVerdict) -> Self {
        Self { realm, verdict }
    }
}

/// Sends REGISTER for one account over one transport
pub struct RegistrationController {
    transport: Arc<dyn Transport>,
    credentials: UserCredentials,
    params: RegisterParams,
    default_expires: u32,
}

impl RegistrationController {
    pub fn new(
        transport: Arc<dyn Transport>,
        account: &SipAccountConfig,
        registrar: &RegistrarAddress,
        expires: u32,
    ) -> Result<Self, DomainError> {
        Ok(Self {
            transport,
            credentials: UserCredentials::new(account.username.trim(), account.password.as_str()),
            params: register_params(account, registrar, expires)?,
            default_expires: expires,
        })
    }

    /// Run one exchange. `session` carries the realm learned earlier.
    pub async fn register(&self, session: Option<RegistrationSession>) -> RegistrationOutcome {
        if !self.transport.is_active() {
            warn!("Transport inactive, not sending REGISTER");
            return RegistrationOutcome::new(None, RegistrationVerdict::TransportInactive);
        }

        let mut request = match build_register_request(&self.params) {
            Ok(request) => request,
            Err(e) => {
                warn!("Failed to build REGISTER: {}", e);
                return RegistrationOutcome::new(
                    None,
                    RegistrationVerdict::Failed(StatusMeta::cause(format!("Registration failed: {}", e))),
                );
            }
        };

        info!(
            "Sending REGISTER for {} to {}",
            self.params.identity_uri, self.params.request_uri
        );
        let mut response = self.send(&request).await;
        let mut realm = None;

        let challenge = response
            .as_ref()
            .filter(|r| matches!(r.status_code(), 401 | 407))
            .cloned();
        if let Some(challenge) = challenge {
            let status = challenge.status_code();
            debug!("REGISTER challenged with {}", status);

            match DigestAuthenticator::authorize(session.as_ref(), &mut request, &challenge, &self.credentials) {
                Ok(learned) => realm = Some(learned),
                Err(e) => {
                    let detail = match e {
                        SipError::Authentication(detail) => detail,
                        other => other.to_string(),
                    };
                    warn!("Could not answer challenge: {}", detail);
                    return RegistrationOutcome::new(
                        None,
                        RegistrationVerdict::Failed(StatusMeta::with_status(
                            format!("Authentication failed: {}", detail),
                            status,
                        )),
                    );
                }
            }

            let cseq = request.cseq().unwrap_or(self.params.cseq);
            request.set_cseq(cseq + 1);
            info!("Resending REGISTER with credentials (CSeq {})", cseq + 1);
            response = self.send(&request).await;
        }

        let verdict = classify_response(response.as_ref(), self.default_expires);
        RegistrationOutcome::new(realm, verdict)
    }

    async fn send(&self, request: &SipRequest) -> Option<SipResponse> {
        match self.transport.send(request.clone()).await {
            Ok(response) => {
                debug!("REGISTER answered with {}", response.status_code());
                Some(response)
            }
            Err(e) => {
                warn!("REGISTER got no response: {}", e);
                None
            }
        }
    }
}

/// Parameters for REGISTER towards `registrar`
pub fn register_params(
    account: &SipAccountConfig,
    registrar: &RegistrarAddress,
    expires: u32,
) -> Result<RegisterParams, DomainError> {
    let request_uri = SipUri::new(
        account.scheme(),
        None,
        registrar.hostname.clone(),
        Some(registrar.port),
    );

    Ok(RegisterParams {
        request_uri: request_uri.to_string(),
        identity_uri: account.identity_uri(&registrar.hostname)?.to_string(),
        display_name: account.display_name.clone(),
        expires,
        cseq: 1,
    })
}

/// Map the final response of an exchange to a verdict.
///
/// A missing response counts as a server error.
pub fn classify_response(response: Option<&SipResponse>, default_expires: u32) -> RegistrationVerdict {
    let Some(response) = response else {
        return RegistrationVerdict::Failed(StatusMeta::cause("Server error"));
    };

    let code = response.status_code();
    match code {
        200..=299 => RegistrationVerdict::Registered {
            expires: response
                .expires()
                .or_else(|| response.contact_expires())
                .unwrap_or(default_expires),
        },
        // A 407 only gets here after its one signed retry
        401 | 403 | 407 => {
            RegistrationVerdict::Failed(StatusMeta::with_status("Authentication failed", code))
        }
        404 => RegistrationVerdict::Failed(StatusMeta::with_status("User not found", code)),
        408 | 500..=u16::MAX => RegistrationVerdict::Failed(StatusMeta::with_status("Server error", code)),
        _ => RegistrationVerdict::Failed(StatusMeta::with_status(
            format!("Registration failed ({})", code),
            code,
        )),
    }
}

/// Refresh halfway through the granted expiry, never sooner than `minimum`
pub fn reregister_delay(expires: u32, minimum: Duration) -> Duration {
    std::cmp::max(Duration::from_millis(u64::from(expires) * 500), minimum)
}
