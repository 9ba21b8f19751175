//! Application layer - Use cases and application services
//!
//! This layer orchestrates the SIP stack to fulfill use cases.
//! It's responsible for:
//! - The registration state machine and its timers
//! - Reconnecting after fatal failures
//! - Publishing status and incoming call events

pub mod health;
pub mod reconnect;
pub mod sip_manager;

pub use health::HealthReport;
pub use reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectScheduler};
pub use sip_manager::SipManager;
