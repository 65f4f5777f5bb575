//! Relay wire types and error definitions

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use super::replay::ReplayMarker;

/// Path of the streaming endpoint on the relay host
pub const LISTEN_PATH: &str = "/stream/listen";

/// Handshake header carrying the serialized listen request
pub const LISTEN_REQUEST_HEADER: &str = "Body";

/// Text frame telling the relay to mark this device offline
pub const DISCONNECT_MESSAGE: &str = "disconnect";

/// Method used when an inbound event does not name one
pub const DEFAULT_FORWARD_METHOD: &str = "POST";

/// Lifecycle of a listen session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Connecting,
    Active,
    Draining,
    Closed,
    Failed(String),
}

impl SessionState {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed(_))
    }
}

/// Subscription parameters presented once at handshake time
#[derive(Debug, Clone, Serialize)]
pub struct ListenRequest {
    pub host_name: String,
    pub project_id: String,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub forward_to: String,

    /// Sent as the first text frame, never as part of the handshake metadata
    #[serde(skip)]
    pub since: Option<ReplayMarker>,
}

impl ListenRequest {
    /// Check the preconditions that must hold before any network activity
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.forward_to.trim().is_empty() {
            return Err(RelayError::Config(
                "flag forward-to cannot be empty".to_string(),
            ));
        }

        let target = url::Url::parse(&self.forward_to).map_err(|e| {
            RelayError::Config(format!("invalid forward-to URL {}: {}", self.forward_to, e))
        })?;
        if !matches!(target.scheme(), "http" | "https") {
            return Err(RelayError::Config(format!(
                "forward-to must be an http(s) URL, got scheme {}",
                target.scheme()
            )));
        }

        Ok(())
    }

    /// Serialize for the handshake side header
    pub fn to_header_value(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Event pushed by the relay
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    pub uid: String,

    /// Header names mapped to their values, duplicates kept in order
    #[serde(default, deserialize_with = "null_as_empty")]
    pub headers: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub data: Option<Box<RawValue>>,

    #[serde(default)]
    pub method: Option<String>,
}

impl InboundEvent {
    /// Decode an application frame
    pub fn from_frame(frame: &str) -> Result<Self, RelayError> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Raw JSON payload exactly as the relay sent it
    pub fn body(&self) -> &[u8] {
        self.data
            .as_deref()
            .map(|raw| raw.get().as_bytes())
            .unwrap_or_default()
    }

    /// Verb to forward with
    pub fn method(&self) -> &str {
        self.method
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(DEFAULT_FORWARD_METHOD)
    }

    pub fn ack(&self) -> AckEventDelivery {
        AckEventDelivery {
            uid: self.uid.clone(),
        }
    }
}

/// Relays encode an event without headers as `null`
fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let headers: Option<BTreeMap<String, Vec<String>>> = Option::deserialize(deserializer)?;
    Ok(headers.unwrap_or_default())
}

/// Acknowledgment echoed back once forwarding was attempted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckEventDelivery {
    pub uid: String,
}

impl AckEventDelivery {
    pub fn to_frame(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Error types for the relay session
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(
        "since is neither a valid time duration or timestamp: {0}, see the listen command help menu for a valid since value"
    )]
    InvalidReplayMarker(String),
    #[error("websocket dialer failed with response: {0}")]
    Handshake(String),
    #[error("WebSocket connection error: {0}")]
    Connection(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
