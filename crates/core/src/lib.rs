//! Shared vocabulary for the Bitzomax conversion client crates.
//!
//! Holds the job identifier type, topic and URL naming conventions, and
//! client-side temporary id generation used by both the message-bus and
//! conversion crates.

pub mod error;
pub mod ids;
pub mod naming;
pub mod types;
