//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - The SIP stack (messages, Digest, transports, REGISTER client)
//! - Registrar reachability probing

pub mod dns;
pub mod protocols;
