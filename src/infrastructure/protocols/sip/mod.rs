//! SIP user agent for a single registered identity
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   SipManager            │
//! │  (application layer)    │
//! └──────┬───────────▲──────┘
//!        │           │
//! ┌──────▼──────┐ ┌──┴──────────────┐
//! │ Registration│ │ RequestDispatcher│
//! │ + Digest    │ │ (INVITE/OPTIONS) │
//! └──────┬──────┘ └──▲──────────────┘
//!        │           │
//! ┌──────▼───────────┴──────┐
//! │   Transport Layer       │
//! │   (UDP, TCP)            │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod dispatcher;
pub mod handler;
pub mod message;
pub mod registration;
pub mod transport;

pub use auth::{AuthChallenge, DigestAuthenticator, UserCredentials};
pub use builder::{build_register_request, RegisterParams, ResponseBuilder};
pub use dispatcher::RequestDispatcher;
pub use handler::RequestHandler;
pub use message::{RequestKind, SipError, SipMessage, SipRequest, SipResponse};
pub use registration::{
    classify_response, reregister_delay, RegistrationController, RegistrationOutcome,
    RegistrationVerdict,
};
pub use transport::{NetworkTransport, SipTimers, Transport, TransportOptions};
