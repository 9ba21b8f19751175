//! Domain layer - Core types of the signaling state machine
//!
//! This layer contains:
//! - Value Objects: SIP URIs, caller IDs
//! - Registration state and status events
//! - Domain Events: Things that happened in the domain

pub mod incoming_call;
pub mod registration;
pub mod shared;

// Re-export commonly used types
pub use incoming_call::IncomingCall;
pub use registration::{ConnectionState, RegistrationSession, StatusEvent, StatusMeta};
pub use shared::{DomainError, Result};
