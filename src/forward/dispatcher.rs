//! Outbound HTTP dispatcher for relayed events

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use reqwest::header::{
    AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT,
};
use reqwest::{Method, Url};
use tracing::{debug, warn};

use super::signature::Signer;
use crate::relay::types::InboundEvent;

/// Round trip budget for one forwarding attempt
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Response bodies are cut at this many bytes
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 50 * 1024;

const RECOGNIZED_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS", "TRACE", "CONNECT",
];

/// Headers the HTTP client owns; never copied from an inbound event
const TRANSPORT_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "te",
    "trailer",
    "proxy-connection",
];

pub fn default_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Error types for forwarding operations that never reached the network
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("invalid target URL: {0}")]
    InvalidUrl(String),
    #[error("unsupported HTTP method: {0}")]
    InvalidMethod(String),
    #[error("signed delivery requires a signature header and secret")]
    MissingSignatureConfig,
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("failed to compute signature: {0}")]
    Signature(String),
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

#[derive(Debug, Clone)]
pub struct ForwarderOptions {
    pub timeout: Duration,
    pub max_response_bytes: usize,
    pub user_agent: String,
    /// Refuse to send unless `signer` is present
    pub signed: bool,
    pub signer: Option<Signer>,
}

impl Default for ForwarderOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FORWARD_TIMEOUT,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            user_agent: default_user_agent(),
            signed: false,
            signer: None,
        }
    }
}

/// Result of one forwarding attempt
#[derive(Debug, Clone, Default)]
pub struct ForwardOutcome {
    /// Status line, e.g. `200 OK`; empty when no response arrived
    pub status: String,
    /// Zero when no response arrived
    pub status_code: u16,
    pub method: String,
    pub url: Option<Url>,
    /// Headers that were sent, or attempted
    pub request_headers: HeaderMap,
    pub response_headers: Option<HeaderMap>,
    /// Response body, capped at the configured byte budget
    pub body: Vec<u8>,
    pub ip: Option<String>,
    /// Human readable transport error
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl ForwardOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status_code)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Delivers event payloads to a local HTTP target
///
/// Holds no mutable state; one instance can serve concurrent calls.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    options: ForwarderOptions,
}

impl Forwarder {
    /// Create a forwarder with its own HTTP client
    pub fn new(options: ForwarderOptions) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| ForwardError::Client(e.to_string()))?;

        Ok(Self::with_client(client, options))
    }

    /// Create a forwarder around an injected client
    pub fn with_client(client: reqwest::Client, options: ForwarderOptions) -> Self {
        Self { client, options }
    }

    /// Forward an inbound relay event without extra credentials
    pub async fn forward_event(
        &self,
        target: &str,
        event: &InboundEvent,
    ) -> Result<ForwardOutcome, ForwardError> {
        self.send(target, event.method(), event.body(), &event.headers, None)
            .await
    }

    /// Send one request and capture a bounded response
    ///
    /// An `Err` means nothing was sent. Transport failures after dispatch come
    /// back as `Ok` with a zero status code and `error` populated.
    pub async fn send(
        &self,
        target: &str,
        method: &str,
        body: &[u8],
        headers: &BTreeMap<String, Vec<String>>,
        credential: Option<&str>,
    ) -> Result<ForwardOutcome, ForwardError> {
        let url = parse_target(target)?;
        let method = parse_method(method)?;
        let request_headers = self.build_headers(body, headers, credential)?;

        let mut outcome = ForwardOutcome {
            method: method.to_string(),
            url: Some(url.clone()),
            request_headers: request_headers.clone(),
            ..Default::default()
        };

        debug!("Forwarding {} {}", method, url);
        let started = Instant::now();

        let result = self
            .client
            .request(method, url)
            .headers(request_headers)
            .body(body.to_vec())
            .timeout(self.options.timeout)
            .send()
            .await;

        match result {
            Ok(mut response) => {
                outcome.status = response.status().to_string();
                outcome.status_code = response.status().as_u16();
                outcome.response_headers = Some(response.headers().clone());
                outcome.ip = response.remote_addr().map(|addr| addr.ip().to_string());

                match read_capped(&mut response, self.options.max_response_bytes).await {
                    Ok(body) => outcome.body = body,
                    Err(e) => {
                        let message = describe_error(&e);
                        warn!("Failed to read forward response body: {}", message);
                        outcome.error = Some(message);
                    }
                }
            }
            Err(e) => {
                let message = describe_error(&e);
                warn!("Failed to forward to {}: {}", target, message);
                outcome.error = Some(message);
            }
        }

        outcome.elapsed = started.elapsed();
        Ok(outcome)
    }

    fn build_headers(
        &self,
        body: &[u8],
        forwarded: &BTreeMap<String, Vec<String>>,
        credential: Option<&str>,
    ) -> Result<HeaderMap, ForwardError> {
        let signer = if self.options.signed {
            Some(
                self.options
                    .signer
                    .as_ref()
                    .ok_or(ForwardError::MissingSignatureConfig)?,
            )
        } else {
            None
        };

        let mut map = HeaderMap::new();
        map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        map.insert(USER_AGENT, header_value(&self.options.user_agent)?);
        if let Some(credential) = credential {
            map.insert(AUTHORIZATION, header_value(&format!("Bearer {}", credential))?);
        }

        for (name, values) in forwarded {
            let name = match HeaderName::from_bytes(name.as_bytes()) {
                Ok(name) => name,
                Err(e) => {
                    warn!("Skipping forwarded header {:?}: {}", name, e);
                    continue;
                }
            };
            if TRANSPORT_HEADERS.contains(&name.as_str()) {
                debug!("Not forwarding transport header {}", name);
                continue;
            }

            map.remove(&name);
            for value in values {
                match HeaderValue::from_str(value) {
                    Ok(value) => {
                        map.append(name.clone(), value);
                    }
                    Err(e) => warn!("Skipping value for forwarded header {}: {}", name, e),
                }
            }
        }

        if let Some(signer) = signer {
            let name = HeaderName::from_bytes(signer.header().as_bytes())
                .map_err(|e| ForwardError::InvalidHeader(format!("{}: {}", signer.header(), e)))?;
            map.insert(name, header_value(&signer.sign(body)?)?);
        }

        Ok(map)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ForwardError> {
    HeaderValue::from_str(value).map_err(|e| ForwardError::InvalidHeader(e.to_string()))
}

fn parse_target(target: &str) -> Result<Url, ForwardError> {
    let url = Url::parse(target).map_err(|e| ForwardError::InvalidUrl(format!("{}: {}", target, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(ForwardError::InvalidUrl(format!(
            "{}: unsupported scheme {}",
            target, scheme
        ))),
    }
}

fn parse_method(method: &str) -> Result<Method, ForwardError> {
    let upper = method.trim().to_ascii_uppercase();
    if !RECOGNIZED_METHODS.contains(&upper.as_str()) {
        return Err(ForwardError::InvalidMethod(method.to_string()));
    }

    Method::from_bytes(upper.as_bytes()).map_err(|_| ForwardError::InvalidMethod(method.to_string()))
}

/// Read at most `limit` bytes, dropping the rest of the stream
async fn read_capped(
    response: &mut reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, reqwest::Error> {
    let mut body = Vec::with_capacity(limit.min(8 * 1024));

    while body.len() < limit {
        match response.chunk().await? {
            Some(chunk) => {
                let take = (limit - body.len()).min(chunk.len());
                body.extend_from_slice(&chunk[..take]);
            }
            None => break,
        }
    }

    Ok(body)
}

/// Flatten an error and its sources into one line
fn describe_error(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
