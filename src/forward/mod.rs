//! Event forwarding module
//!
//! Delivers relayed payloads to the local HTTP target and captures a
//! size-bounded response for logging.

pub mod dispatcher;
pub mod signature;

// Re-export commonly used types
pub use dispatcher::{ForwardError, ForwardOutcome, Forwarder, ForwarderOptions};
pub use signature::Signer;
