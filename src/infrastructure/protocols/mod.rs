//! Signaling protocol implementations

pub mod sip;
