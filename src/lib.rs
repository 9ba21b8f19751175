//! sipwatch - SIP registration watcher
//!
//! Keeps one SIP identity registered with its registrar, recovers from
//! network and server failures, and reports caller ID for incoming INVITEs
//! without ever answering them.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{HealthReport, SipManager};
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
pub use domain::{ConnectionState, IncomingCall, StatusEvent};
