//! Incoming request dispatcher
//!
//! Routes every request the registrar sends us to a canned response. INVITEs
//! are rung and then rejected; the caller ID is published on the way.

use super::handler::RequestHandler;
use super::message::{RequestKind, SipError, SipRequest};
use super::transport::Transport;
use crate::domain::incoming_call::IncomingCall;
use crate::domain::registration::ConnectionState;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Answers unsolicited requests on behalf of the registered identity
pub struct RequestDispatcher {
    transport: Arc<dyn Transport>,
    state: watch::Receiver<ConnectionState>,
    calls: broadcast::Sender<IncomingCall>,
    busy_delay: Duration,
}

impl RequestDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        state: watch::Receiver<ConnectionState>,
        calls: broadcast::Sender<IncomingCall>,
        busy_delay: Duration,
    ) -> Self {
        Self {
            transport,
            state,
            calls,
            busy_delay,
        }
    }

    /// The binding only counts while registered over a live transport
    fn is_available(&self) -> bool {
        *self.state.borrow() == ConnectionState::Registered && self.transport.is_active()
    }

    async fn dispatch(&self, request: &SipRequest) -> Result<(), SipError> {
        if !self.is_available() {
            debug!(
                "Rejecting {} while {} (transport active: {})",
                request.method(),
                *self.state.borrow(),
                self.transport.is_active()
            );
            return reply(self.transport.as_ref(), request, 503, "Service Unavailable").await;
        }

        match request.kind() {
            RequestKind::Invite => self.handle_invite(request).await,
            RequestKind::Register => {
                reply(self.transport.as_ref(), request, 405, "Method Not Allowed").await
            }
            RequestKind::Options => reply(self.transport.as_ref(), request, 200, "OK").await,
            RequestKind::Other(method) => {
                debug!("Unsupported method {}", method);
                reply(self.transport.as_ref(), request, 501, "Not Implemented").await
            }
        }
    }

    async fn handle_invite(&self, request: &SipRequest) -> Result<(), SipError> {
        let Some(call) = request
            .from_value()
            .as_deref()
            .and_then(IncomingCall::from_header_value)
        else {
            warn!("INVITE without a caller URI in From");
            return reply(self.transport.as_ref(), request, 400, "Bad Request").await;
        };

        reply(self.transport.as_ref(), request, 100, "Trying").await?;
        reply(self.transport.as_ref(), request, 180, "Ringing").await?;

        info!(
            "Incoming call from {} <{}>",
            call.display_name, call.normalized_number
        );
        if self.calls.send(call).is_err() {
            debug!("No incoming call subscribers");
        }

        // The call is never answered; reject it once the caller ID is out
        let transport = self.transport.clone();
        let state = self.state.clone();
        let request = request.clone();
        let delay = self.busy_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let still_bound = *state.borrow() == ConnectionState::Registered && transport.is_active();
            if !still_bound {
                debug!("Skipping 486, binding went away");
                return;
            }
            if let Err(e) = reply(transport.as_ref(), &request, 486, "Busy Here").await {
                warn!("Failed to send 486 Busy Here: {}", e);
            }
        });

        Ok(())
    }
}

async fn reply(
    transport: &dyn Transport,
    request: &SipRequest,
    code: u16,
    reason: &str,
) -> Result<(), SipError> {
    let response = transport.make_response(request, code, reason)?;
    transport.respond(request, response).await
}

#[async_trait]
impl RequestHandler for RequestDispatcher {
    async fn handle_request(&self, request: SipRequest) {
        debug!("Dispatching {} from {:?}", request.method(), request.source);

        if let Err(e) = self.dispatch(&request).await {
            error!("Failed to handle {}: {}", request.method(), e);
            if let Err(e) = reply(self.transport.as_ref(), &request, 500, "Server Internal Error").await {
                error!("Request left unanswered: {}", e);
            }
        }
    }
}
