//! Resilient client for long-lived remote shell sessions.
//!
//! Provides:
//! - Marker framing and output extraction
//! - Output sanitizing
//! - `SessionClient`, the per-session execute state machine with reattach,
//!   stall detection and interrupt recovery
//! - Discovery of newly created sessions

mod attempt;
mod client;
mod discover;
pub mod marker;
pub mod recovery;
pub mod sanitize;

#[cfg(test)]
mod test_support;

pub use attempt::is_keepalive_drop;
pub use client::{ClientError, SessionClient};
pub use discover::open_remote_session;
pub use marker::{Extracted, MarkerPair};
pub use recovery::{ProbeOutcome, interrupt_and_probe};
pub use sanitize::sanitize;
