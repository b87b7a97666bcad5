// Route model: the registration payload for one backend instance and the
// host[/prefix] key it registers under.

pub mod pool;

pub use pool::{EndpointPool, EndpointSnapshot};

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// One backend instance. Identity is `(address, port)`; everything else is
/// metadata that the most recent registration overwrites.
#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    /// Stable id used for sticky-session routing.
    pub private_instance_id: String,
    /// Tenant/app/instance indices, forwarded to telemetry.
    pub tags: HashMap<String, String>,
    /// Policy endpoint that must see requests before this backend does.
    pub route_service_url: Option<String>,
    /// Freshness budget; registrations must refresh within it.
    #[serde(with = "serde_duration_secs")]
    pub stale_threshold: Duration,
}

mod serde_duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            private_instance_id: String::new(),
            tags: HashMap::new(),
            route_service_url: None,
            stale_threshold: Duration::from_secs(120),
        }
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.private_instance_id = id.into();
        self
    }

    pub fn with_stale_threshold(mut self, ttl: Duration) -> Self {
        self.stale_threshold = ttl;
        self
    }

    pub fn with_route_service_url(mut self, url: impl Into<String>) -> Self {
        self.route_service_url = Some(url.into());
        self
    }

    /// The `address:port` authority used for dialing and for identity checks.
    pub fn canonical_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Identity comparison per the registry contract.
    pub fn same_instance(&self, other: &Endpoint) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteKeyError {
    #[error("route key has an empty host")]
    EmptyHost,
    #[error("route key host contains invalid character {0:?}")]
    InvalidHostChar(char),
}

/// A case-insensitive hostname plus optional path prefix, e.g.
/// `foo.example.com/api`. The parsed form is what the registry indexes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    host: String,
    path: String,
}

impl RouteKey {
    /// Parse `host[/prefix]`. Hosts are lowercased and port-stripped;
    /// a trailing slash on the prefix is dropped so `host/a/` and `host/a`
    /// collide as intended.
    pub fn parse(raw: &str) -> Result<Self, RouteKeyError> {
        let (host_part, path_part) = match raw.find('/') {
            Some(idx) => (&raw[..idx], &raw[idx..]),
            None => (raw, ""),
        };

        let host = normalize_host(host_part);
        if host.is_empty() {
            return Err(RouteKeyError::EmptyHost);
        }
        if let Some(bad) = host
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '*')))
        {
            return Err(RouteKeyError::InvalidHostChar(bad));
        }

        let path = path_part.trim_end_matches('/').to_string();
        Ok(Self { host, path })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The path prefix, always either empty or starting with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_wildcard(&self) -> bool {
        self.host.starts_with("*.")
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.host, self.path)
    }
}

/// Lowercase and strip any `:port` suffix.
pub fn normalize_host(host: &str) -> String {
    let bare = host.split(':').next().unwrap_or(host);
    bare.to_ascii_lowercase()
}
