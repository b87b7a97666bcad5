//! Route-service indirection: requests for routes bound to a policy
//! endpoint detour through it carrying a signed, encrypted envelope that
//! names the original URL and when the router first saw the request. The
//! return leg presents the same envelope; only a fresh, authentic envelope
//! is allowed through to the backend.

use anyhow::Result;
use chrono::{DateTime, Utc};
use ring::digest;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::RouteServiceConfig;
use crate::crypto::AesGcm;

pub const SIGNATURE_HEADER: &str = "X-CF-Proxy-Signature";
pub const METADATA_HEADER: &str = "X-CF-Proxy-Metadata";
pub const FORWARDED_URL_HEADER: &str = "X-CF-Forwarded-Url";

/// The sealed payload. `forwarded_url` lets the return leg reconstruct the
/// original target; `request_received_at` bounds replay.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub forwarded_url: String,
    pub request_received_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    /// Decryption failed under every configured key generation.
    #[error("route service signature did not verify")]
    Signature,
    /// Authentic but older than the freshness window.
    #[error("route service envelope expired")]
    Expired,
}

struct KeyGeneration {
    cipher: AesGcm,
    id: String,
}

/// Short stable identifier for a key generation, safe to put on the wire.
fn key_id(secret: &str) -> String {
    let hash = digest::digest(&digest::SHA256, secret.as_bytes());
    hash.as_ref()[..4]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Seals and verifies route-service envelopes. Exactly two key generations
/// are supported: the active one signs, both verify.
pub struct RouteServiceSigner {
    active: KeyGeneration,
    previous: Option<KeyGeneration>,
    freshness_window: Duration,
    pub recommend_https: bool,
}

impl RouteServiceSigner {
    /// Build from config. Returns None when route services are disabled;
    /// an enabled config with an unusable secret is a startup error.
    pub fn from_config(config: &RouteServiceConfig) -> Result<Option<Self>> {
        if !config.route_service_enabled {
            return Ok(None);
        }
        let active = KeyGeneration {
            cipher: AesGcm::from_secret(&config.route_service_secret)?,
            id: key_id(&config.route_service_secret),
        };
        let previous = if config.route_service_secret_prev.is_empty() {
            None
        } else {
            Some(KeyGeneration {
                cipher: AesGcm::from_secret(&config.route_service_secret_prev)?,
                id: key_id(&config.route_service_secret_prev),
            })
        };
        Ok(Some(Self {
            active,
            previous,
            freshness_window: config.freshness_window(),
            recommend_https: config.route_service_recommend_https,
        }))
    }

    /// Seal an envelope for `forwarded_url`, returning the
    /// (signature, metadata) header values.
    pub fn sign(&self, forwarded_url: &str) -> Result<(String, String)> {
        let envelope = Envelope {
            forwarded_url: forwarded_url.to_string(),
            request_received_at: Utc::now(),
        };
        let plaintext = serde_json::to_vec(&envelope)?;
        let signature = self.active.cipher.seal(&plaintext)?;
        Ok((signature, self.active.id.clone()))
    }

    /// Open and validate a presented envelope. The metadata key id picks the
    /// generation to try first; on mismatch both generations are tried,
    /// active before previous.
    pub fn verify(&self, signature: &str, metadata: &str) -> Result<Envelope, VerifyError> {
        let plaintext = self
            .generations_for(metadata)
            .into_iter()
            .find_map(|generation| generation.cipher.open(signature).ok())
            .ok_or(VerifyError::Signature)?;

        let envelope: Envelope =
            serde_json::from_slice(&plaintext).map_err(|_| VerifyError::Signature)?;

        let age = Utc::now().signed_duration_since(envelope.request_received_at);
        if age.num_milliseconds() > self.freshness_window.as_millis() as i64 {
            return Err(VerifyError::Expired);
        }
        Ok(envelope)
    }

    fn generations_for(&self, metadata: &str) -> Vec<&KeyGeneration> {
        let mut order = Vec::with_capacity(2);
        order.push(&self.active);
        if let Some(prev) = &self.previous {
            order.push(prev);
        }
        // A known key id moves its generation to the front.
        if let Some(idx) = order.iter().position(|g| g.id == metadata) {
            order.rotate_left(idx);
        }
        order
    }
}

/// A route service reached over plain HTTP downgrades an HTTPS request.
/// With `recommend_https` set that downgrade is refused.
pub fn insecure_downgrade(inbound_https: bool, route_service_url: &str) -> bool {
    inbound_https && route_service_url.starts_with("http://")
}
