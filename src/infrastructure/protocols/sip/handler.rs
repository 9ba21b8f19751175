//! SIP message handlers

use super::message::SipRequest;
use async_trait::async_trait;

/// Receives requests the peer sends to us unsolicited.
///
/// Implementations must answer every request through the transport.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle a SIP request
    async fn handle_request(&self, request: SipRequest);
}
