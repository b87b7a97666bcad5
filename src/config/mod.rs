use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsListenerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub routing_api: RoutingApiConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub route_service: RouteServiceConfig,
    #[serde(default)]
    pub access_log: AccessLogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Port the HTTP proxy listener binds.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Port for /healthz, /varz, /routes and /metrics.
    #[serde(default = "default_status_port")]
    pub status_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            status_port: default_status_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_status_port() -> u16 {
    8082
}

/// Optional HTTPS listener. TLS for general client traffic is expected to
/// terminate upstream of the router; this listener exists for routes that
/// opt in to router-terminated TLS (sticky routing needs cookie visibility).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsListenerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_https_port")]
    pub port: u16,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Restrict the cipher suites offered to clients. Names follow the
    /// IANA registry (e.g. "TLS13_AES_128_GCM_SHA256"). Empty means the
    /// rustls defaults.
    #[serde(default)]
    pub cipher_suites: Vec<String>,
}

fn default_https_port() -> u16 {
    8443
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Whole-round-trip budget for one upstream attempt, in seconds.
    #[serde(default = "default_endpoint_timeout")]
    pub endpoint_timeout: u64,
    /// How long graceful shutdown waits for in-flight requests.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: u64,
    /// Attempts against distinct pool members on connection-level failure.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Request bodies up to this many bytes are buffered so a failed dial
    /// can be retried; larger bodies stream and get a single attempt.
    #[serde(default = "default_retry_buffer_limit")]
    pub retry_buffer_limit: usize,
    /// Idle upstream connections kept per backend.
    #[serde(default = "default_pool_idle_per_host")]
    pub pool_idle_per_host: usize,
    /// Set the Secure flag on the sticky cookie.
    #[serde(default)]
    pub secure_cookies: bool,
    /// Trust X-Forwarded-Proto from the front end instead of the listener
    /// scheme.
    #[serde(default)]
    pub trust_frontend_proto: bool,
    /// Response cookies that trigger session affinity.
    #[serde(default = "default_sticky_trigger_cookies")]
    pub sticky_trigger_cookies: Vec<String>,
    /// Request headers copied verbatim into every access-log line.
    #[serde(default)]
    pub extra_headers_to_log: Vec<String>,
    /// Skip upstream certificate verification (route services over TLS).
    #[serde(default)]
    pub ssl_skip_validation: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            endpoint_timeout: default_endpoint_timeout(),
            drain_timeout: default_drain_timeout(),
            max_attempts: default_max_attempts(),
            retry_buffer_limit: default_retry_buffer_limit(),
            pool_idle_per_host: default_pool_idle_per_host(),
            secure_cookies: false,
            trust_frontend_proto: false,
            sticky_trigger_cookies: default_sticky_trigger_cookies(),
            extra_headers_to_log: Vec::new(),
            ssl_skip_validation: false,
        }
    }
}

fn default_endpoint_timeout() -> u64 {
    60
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_max_attempts() -> usize {
    3
}

fn default_retry_buffer_limit() -> usize {
    64 * 1024
}

fn default_pool_idle_per_host() -> usize {
    10
}

fn default_sticky_trigger_cookies() -> Vec<String> {
    vec!["JSESSIONID".to_string()]
}

impl ProxyConfig {
    pub fn endpoint_timeout(&self) -> Duration {
        Duration::from_secs(self.endpoint_timeout)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Seconds between full stale-endpoint sweeps.
    #[serde(default = "default_pruning_interval")]
    pub pruning_interval: u64,
    /// TTL applied to registrations that do not carry their own.
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_default: u64,
    /// Seconds a MarkFailed endpoint is skipped by selection before it is
    /// probed again.
    #[serde(default = "default_healthy_threshold")]
    pub load_balancer_healthy_threshold: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            pruning_interval: default_pruning_interval(),
            stale_threshold_default: default_stale_threshold(),
            load_balancer_healthy_threshold: default_healthy_threshold(),
        }
    }
}

fn default_pruning_interval() -> u64 {
    30
}

fn default_stale_threshold() -> u64 {
    120
}

fn default_healthy_threshold() -> u64 {
    30
}

impl RegistryConfig {
    pub fn pruning_interval(&self) -> Duration {
        Duration::from_secs(self.pruning_interval)
    }

    pub fn stale_threshold_default(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_default)
    }

    pub fn failed_endpoint_backoff(&self) -> Duration {
        Duration::from_secs(self.load_balancer_healthy_threshold)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    /// Bus endpoints handed to the external pub-sub client.
    #[serde(default)]
    pub nats_servers: Vec<String>,
    /// Seconds between repeated router.start announcements.
    #[serde(default = "default_start_interval")]
    pub start_interval: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            nats_servers: Vec::new(),
            start_interval: default_start_interval(),
        }
    }
}

fn default_start_interval() -> u64 {
    30
}

impl NatsConfig {
    pub fn start_interval(&self) -> Duration {
        Duration::from_secs(self.start_interval)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingApiConfig {
    pub uri: Option<String>,
    #[serde(default = "default_routing_api_port")]
    pub port: u16,
    #[serde(default)]
    pub auth_disabled: bool,
    /// Seconds between polls of the routing API.
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval: u64,
}

impl Default for RoutingApiConfig {
    fn default() -> Self {
        Self {
            uri: None,
            port: default_routing_api_port(),
            auth_disabled: false,
            fetch_interval: default_fetch_interval(),
        }
    }
}

fn default_routing_api_port() -> u16 {
    443
}

fn default_fetch_interval() -> u64 {
    30
}

impl RoutingApiConfig {
    pub fn enabled(&self) -> bool {
        self.uri.is_some()
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OAuthConfig {
    pub token_endpoint: Option<String>,
    #[serde(default = "default_oauth_port")]
    pub port: u16,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub client_secret: String,
    /// Skip TLS verification against the token endpoint.
    #[serde(default)]
    pub skip_verification: bool,
}

fn default_oauth_port() -> u16 {
    443
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteServiceConfig {
    #[serde(default)]
    pub route_service_enabled: bool,
    #[serde(default)]
    pub route_service_secret: String,
    /// Previous-generation secret kept valid during rotation.
    #[serde(default)]
    pub route_service_secret_prev: String,
    /// Freshness window for a signed envelope, in seconds.
    #[serde(default = "default_route_service_timeout")]
    pub route_service_timeout: u64,
    /// Refuse HTTP route services when the inbound request was HTTPS.
    #[serde(default)]
    pub route_service_recommend_https: bool,
}

impl Default for RouteServiceConfig {
    fn default() -> Self {
        Self {
            route_service_enabled: false,
            route_service_secret: String::new(),
            route_service_secret_prev: String::new(),
            route_service_timeout: default_route_service_timeout(),
            route_service_recommend_https: false,
        }
    }
}

fn default_route_service_timeout() -> u64 {
    60
}

impl RouteServiceConfig {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.route_service_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessLogConfig {
    /// Destination file. None disables the writer; records still feed varz.
    pub file: Option<PathBuf>,
    /// Also echo access lines to stdout.
    #[serde(default)]
    pub stdout: bool,
    /// Completed records buffered before the oldest is dropped.
    #[serde(default = "default_access_log_depth")]
    pub queue_depth: usize,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            file: None,
            stdout: false,
            queue_depth: default_access_log_depth(),
        }
    }
}

fn default_access_log_depth() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            let parsed: Config = toml::from_str(&raw)
                .with_context(|| format!("{} is not a valid router config", path.display()))?;
            info!(config = %path.display(), "Configuration loaded");
            parsed
        } else {
            info!(config = %path.display(), "Config file absent, running on defaults");
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Consistency checks that must fail startup rather than let the router
    /// degrade silently.
    pub fn validate(&self) -> Result<()> {
        if self.route_service.route_service_enabled
            && self.route_service.route_service_secret.is_empty()
        {
            anyhow::bail!("route_service_enabled requires route_service_secret");
        }
        if self.tls.enabled && (self.tls.cert_path.is_none() || self.tls.key_path.is_none()) {
            anyhow::bail!("tls.enabled requires cert_path and key_path");
        }
        if self.routing_api.enabled()
            && !self.routing_api.auth_disabled
            && self.oauth.token_endpoint.is_none()
        {
            anyhow::bail!("routing_api requires oauth.token_endpoint unless auth_disabled");
        }
        if self.proxy.max_attempts == 0 {
            anyhow::bail!("proxy.max_attempts must be at least 1");
        }
        Ok(())
    }
}
