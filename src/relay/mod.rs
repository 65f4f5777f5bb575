//! Relay streaming module
//!
//! Handles the persistent WebSocket session with the relay server: handshake,
//! replay requests, per-event acknowledgments, liveness and shutdown.

pub mod replay;
pub mod signal;
pub mod socket;
pub mod types;

// Re-export commonly used types
pub use replay::ReplayMarker;
pub use socket::{ListenerOptions, RelayListener, SessionStats};
pub use types::*;
