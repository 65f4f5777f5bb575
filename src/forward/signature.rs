//! HMAC request signing

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::dispatcher::ForwardError;

type HmacSha256 = Hmac<Sha256>;

/// Header name and shared secret used to sign forwarded bodies
#[derive(Clone)]
pub struct Signer {
    header: String,
    secret: String,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("header", &self.header)
            .field("secret", &"***")
            .finish()
    }
}

impl Signer {
    pub fn new(header: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            secret: secret.into(),
        }
    }

    /// Build a signer only when both halves are configured
    pub fn from_parts(header: Option<&str>, secret: Option<&str>) -> Option<Self> {
        match (header, secret) {
            (Some(header), Some(secret))
                if !header.trim().is_empty() && !secret.is_empty() =>
            {
                Some(Self::new(header.trim(), secret))
            }
            _ => None,
        }
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    /// Hex encoded HMAC-SHA256 of the body, computed fresh on every call
    pub fn sign(&self, body: &[u8]) -> Result<String, ForwardError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ForwardError::Signature(e.to_string()))?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}
