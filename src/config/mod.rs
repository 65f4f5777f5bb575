//! Configuration management module
//!
//! Handles loading, validation, and management of agent configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::forward::{ForwarderOptions, Signer, dispatcher::default_user_agent};
use crate::relay::ListenerOptions;
use crate::relay::socket::ping_period;

const DEFAULT_CONFIG_DIR: &str = ".hookrelay";
const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Relay host URL, e.g. https://relay.example.com
    pub host: String,

    /// Device credential issued at login
    pub api_key: String,

    /// Device registered for this machine
    pub device_id: String,

    /// Active project
    pub project_id: String,

    /// Logging level
    pub log_level: String,

    /// File-based logging configuration
    pub log: LogConfig,

    /// Outbound forwarding configuration
    pub forward: ForwardConfig,

    /// Streaming session timings
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Rolling log file; empty keeps logging on stderr only
    pub file_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Request timeout in seconds
    pub timeout_seconds: u64,

    /// Response bodies are truncated past this size
    pub max_response_bytes: usize,

    /// Sign every forwarded body
    pub signed: bool,

    /// Header that carries the signature
    pub signature_header: Option<String>,

    /// Shared HMAC secret
    pub signature_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Give up on a relay that does not answer the upgrade
    pub handshake_timeout_secs: u64,

    /// Time allowed to write one frame
    pub write_wait_secs: u64,

    /// Relay read timeout; pings go out at 9/10 of this
    pub pong_wait_secs: u64,

    /// Wait for the relay to finish closing before exiting
    pub shutdown_grace_ms: u64,
}

/// Identity values the listen session needs from the stored login
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub host: String,
    pub api_key: String,
    pub project_id: String,
    pub device_id: String,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 10,
            max_response_bytes: 50 * 1024,
            signed: false,
            signature_header: None,
            signature_secret: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 45,
            write_wait_secs: 10,
            pong_wait_secs: 10,
            shutdown_grace_ms: 1000,
        }
    }
}

impl Config {
    /// Default location: ~/.hookrelay/config.toml
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_CONFIG_DIR)
            .join(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from file with environment variable overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load the file when it exists, otherwise start from defaults
    ///
    /// Environment overrides apply either way.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load_from_file(path);
        }

        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        // HOOKRELAY_HOST - relay host URL
        if let Ok(host) = env::var("HOOKRELAY_HOST") {
            self.host = host;
        }

        // HOOKRELAY_API_KEY - device credential
        if let Ok(api_key) = env::var("HOOKRELAY_API_KEY") {
            self.api_key = api_key;
        }

        if let Ok(device_id) = env::var("HOOKRELAY_DEVICE_ID") {
            self.device_id = device_id;
        }

        if let Ok(project_id) = env::var("HOOKRELAY_PROJECT_ID") {
            self.project_id = project_id;
        }

        // HOOKRELAY_LOG_LEVEL - logging level
        if let Ok(log_level) = env::var("HOOKRELAY_LOG_LEVEL") {
            self.log_level = log_level;
        }

        // HOOKRELAY_LOG_FILE_PATH - logging destination file
        if let Ok(file_path) = env::var("HOOKRELAY_LOG_FILE_PATH") {
            self.log.file_path = file_path;
        }

        // HOOKRELAY_FORWARD_TIMEOUT_SECONDS - forward timeout
        if let Ok(timeout) = env::var("HOOKRELAY_FORWARD_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse::<u64>() {
                self.forward.timeout_seconds = value;
            }
        }

        // HOOKRELAY_FORWARD_MAX_RESPONSE_BYTES - response capture limit
        if let Ok(limit) = env::var("HOOKRELAY_FORWARD_MAX_RESPONSE_BYTES") {
            if let Ok(value) = limit.parse::<usize>() {
                self.forward.max_response_bytes = value;
            }
        }

        if let Ok(header) = env::var("HOOKRELAY_SIGNATURE_HEADER") {
            self.forward.signature_header = Some(header);
        }

        if let Ok(secret) = env::var("HOOKRELAY_SIGNATURE_SECRET") {
            self.forward.signature_secret = Some(secret);
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !self.host.trim().is_empty() {
            let url = url::Url::parse(self.host.trim())
                .with_context(|| format!("Invalid host URL: {}", self.host))?;
            if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
                anyhow::bail!("Host must be an http(s) or ws(s) URL: {}", self.host);
            }
            if url.host_str().is_none() {
                anyhow::bail!("Host URL has no host: {}", self.host);
            }
        }

        if self.forward.timeout_seconds == 0 {
            anyhow::bail!("forward.timeout_seconds must be greater than 0");
        }

        if self.session.handshake_timeout_secs == 0 {
            anyhow::bail!("session.handshake_timeout_secs must be greater than 0");
        }

        if self.session.write_wait_secs == 0 {
            anyhow::bail!("session.write_wait_secs must be greater than 0");
        }

        if self.session.pong_wait_secs < 2 {
            anyhow::bail!("session.pong_wait_secs must be at least 2");
        }

        if self.forward.signed && self.signer().is_none() {
            anyhow::bail!(
                "forward.signed requires both forward.signature_header and forward.signature_secret"
            );
        }

        Ok(())
    }

    /// Credentials required to open a listen session
    pub fn credentials(&self) -> Result<Credentials> {
        if self.host.trim().is_empty() {
            anyhow::bail!("host is required, log in first or set HOOKRELAY_HOST");
        }
        if self.api_key.trim().is_empty() {
            anyhow::bail!("api key is required, log in first or set HOOKRELAY_API_KEY");
        }
        if self.device_id.trim().is_empty() {
            anyhow::bail!("device id is required, log in first or set HOOKRELAY_DEVICE_ID");
        }

        Ok(Credentials {
            host: self.host.trim().to_string(),
            api_key: self.api_key.trim().to_string(),
            project_id: self.project_id.trim().to_string(),
            device_id: self.device_id.trim().to_string(),
        })
    }

    pub fn signer(&self) -> Option<Signer> {
        Signer::from_parts(
            self.forward.signature_header.as_deref(),
            self.forward.signature_secret.as_deref(),
        )
    }

    pub fn forwarder_options(&self) -> ForwarderOptions {
        ForwarderOptions {
            timeout: Duration::from_secs(self.forward.timeout_seconds),
            max_response_bytes: self.forward.max_response_bytes,
            user_agent: default_user_agent(),
            signed: self.forward.signed,
            signer: self.signer(),
        }
    }

    pub fn listener_options(&self, credentials: &Credentials) -> ListenerOptions {
        let mut options = ListenerOptions::new(&credentials.host, &credentials.api_key);
        options.handshake_timeout = Duration::from_secs(self.session.handshake_timeout_secs);
        options.write_wait = Duration::from_secs(self.session.write_wait_secs);
        options.ping_period = ping_period(Duration::from_secs(self.session.pong_wait_secs));
        options.shutdown_grace = Duration::from_millis(self.session.shutdown_grace_ms);
        options
    }

    /// Configured log level, or `fallback` when the file leaves it unset
    pub fn log_level_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.log_level.trim().is_empty() {
            fallback
        } else {
            self.log_level.trim()
        }
    }

    /// Display formatted configuration with secrets masked
    pub fn display(&self, source: &Path) -> Result<()> {
        let mut masked = self.clone();
        masked.api_key = mask(&masked.api_key);
        masked.forward.signature_secret = masked.forward.signature_secret.as_deref().map(mask);

        println!("Configuration from {}:", source.display());
        println!(
            "{}",
            toml::to_string_pretty(&masked).context("Failed to serialize configuration")?
        );
        Ok(())
    }
}

fn mask(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let visible: String = secret.chars().take(4).collect();
    format!("{}****", visible)
}
