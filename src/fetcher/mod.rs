//! Routing-API ingest: periodically pulls the authoritative route set and
//! writes it through the registry's idempotent register interface. Routes
//! absent from a response are never unregistered here; TTL pruning owns
//! removal, so an API outage cannot blackhole traffic that is still alive.

use anyhow::{Context, Result};
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{OAuthConfig, RoutingApiConfig};
use crate::registry::RouteRegistry;
use crate::route::{Endpoint, RouteKey};

/// Backoff ceiling between failed fetch rounds.
const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Seconds a cached token is considered expired ahead of its real expiry.
const TOKEN_EXPIRY_BUFFER: u64 = 30;

/// One route as the routing API reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiRoute {
    pub route: String,
    pub ip: String,
    pub port: u16,
    pub ttl: u64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub route_service_url: Option<String>,
    #[serde(default)]
    pub private_instance_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    token: String,
    fetched_at: Instant,
    expires_in: u64,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        let lifetime = self.expires_in.saturating_sub(TOKEN_EXPIRY_BUFFER);
        self.fetched_at.elapsed() < Duration::from_secs(lifetime)
    }
}

/// Client-credentials token client with a cached token. The endpoint is the
/// external OAuth server; only the grant exchange lives here.
pub struct OAuthTokenClient {
    http: reqwest::Client,
    token_url: String,
    client_name: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl OAuthTokenClient {
    pub fn new(config: &OAuthConfig) -> Result<Self> {
        let endpoint = config
            .token_endpoint
            .as_deref()
            .context("oauth.token_endpoint is required")?;
        let token_url = if endpoint.contains("://") {
            format!("{}/oauth/token", endpoint.trim_end_matches('/'))
        } else {
            format!("https://{}:{}/oauth/token", endpoint, config.port)
        };
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.skip_verification)
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build OAuth HTTP client")?;
        Ok(Self {
            http,
            token_url,
            client_name: config.client_name.clone(),
            client_secret: config.client_secret.clone(),
            cached: Mutex::new(None),
        })
    }

    pub async fn fetch_token(&self, force_refresh: bool) -> Result<String> {
        if !force_refresh {
            let cached = self.cached.lock().unwrap();
            if let Some(token) = cached.as_ref() {
                if token.is_fresh() {
                    return Ok(token.token.clone());
                }
            }
        }

        debug!(endpoint = %self.token_url, "Fetching OAuth token");
        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_name, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .context("Token request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Token endpoint returned {}", response.status());
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token response")?;

        let mut cached = self.cached.lock().unwrap();
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            fetched_at: Instant::now(),
            expires_in: token.expires_in,
        });
        Ok(token.access_token)
    }
}

/// Bearer-token strategy: no auth at all when the routing API runs with
/// auth disabled.
pub enum TokenSource {
    Disabled,
    OAuth(OAuthTokenClient),
}

impl TokenSource {
    pub async fn bearer(&self, force_refresh: bool) -> Result<Option<String>> {
        match self {
            TokenSource::Disabled => Ok(None),
            TokenSource::OAuth(client) => Ok(Some(client.fetch_token(force_refresh).await?)),
        }
    }
}

pub struct RouteFetcher {
    registry: Arc<RouteRegistry>,
    http: reqwest::Client,
    routes_url: String,
    token: TokenSource,
    interval: Duration,
}

impl RouteFetcher {
    pub fn new(
        config: &RoutingApiConfig,
        oauth: &OAuthConfig,
        registry: Arc<RouteRegistry>,
    ) -> Result<Self> {
        let uri = config.uri.as_deref().context("routing_api.uri is required")?;
        let base = if uri.contains("://") {
            uri.trim_end_matches('/').to_string()
        } else {
            format!("https://{}:{}", uri, config.port)
        };
        let routes_url = format!("{}/routing/v1/routes", base);

        let token = if config.auth_disabled {
            TokenSource::Disabled
        } else {
            TokenSource::OAuth(OAuthTokenClient::new(oauth)?)
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build routing API HTTP client")?;

        Ok(Self {
            registry,
            http,
            routes_url,
            token,
            interval: config.fetch_interval(),
        })
    }

    /// One fetch round. A 401 forces a token refresh and a single retry.
    pub async fn fetch_once(&self) -> Result<usize> {
        match self.fetch_with_token(false).await? {
            FetchOutcome::Routes(routes) => Ok(self.apply(routes)),
            FetchOutcome::Unauthorized => {
                info!("Routing API rejected token, refreshing");
                match self.fetch_with_token(true).await? {
                    FetchOutcome::Routes(routes) => Ok(self.apply(routes)),
                    FetchOutcome::Unauthorized => {
                        anyhow::bail!("Routing API rejected a freshly fetched token")
                    }
                }
            }
        }
    }

    async fn fetch_with_token(&self, force_refresh: bool) -> Result<FetchOutcome> {
        let mut request = self.http.get(&self.routes_url);
        if let Some(token) = self.token.bearer(force_refresh).await? {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.context("Routing API request failed")?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(FetchOutcome::Unauthorized);
        }
        if !response.status().is_success() {
            anyhow::bail!("Routing API returned {}", response.status());
        }

        let routes: Vec<ApiRoute> = response
            .json()
            .await
            .context("Failed to parse routing API response")?;
        Ok(FetchOutcome::Routes(routes))
    }

    fn apply(&self, routes: Vec<ApiRoute>) -> usize {
        let mut applied = 0;
        for route in routes {
            let key = match RouteKey::parse(&route.route) {
                Ok(key) => key,
                Err(e) => {
                    warn!(route = %route.route, error = %e, "Skipping malformed route from API");
                    continue;
                }
            };
            let mut endpoint = Endpoint::new(route.ip, route.port)
                .with_stale_threshold(Duration::from_secs(route.ttl));
            endpoint.tags = route.tags;
            endpoint.route_service_url = route.route_service_url;
            if let Some(id) = route.private_instance_id {
                endpoint.private_instance_id = id;
            }
            self.registry.register(&key, endpoint);
            applied += 1;
        }
        debug!(applied, "Applied routing API routes");
        applied
    }

    /// Poll until shutdown. Failures back off exponentially with jitter,
    /// capped, and never take the router down.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(url = %self.routes_url, interval_secs = self.interval.as_secs(), "Route fetcher started");
        let mut consecutive_failures: u32 = 0;
        loop {
            let delay = if consecutive_failures == 0 {
                self.interval
            } else {
                backoff_with_jitter(self.interval, consecutive_failures)
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Route fetcher stopping");
                        return;
                    }
                }
            }
            match self.fetch_once().await {
                Ok(applied) => {
                    consecutive_failures = 0;
                    debug!(applied, "Route fetch complete");
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    warn!(error = %e, consecutive_failures, "Route fetch failed");
                }
            }
        }
    }
}

enum FetchOutcome {
    Routes(Vec<ApiRoute>),
    Unauthorized,
}

fn backoff_with_jitter(base: Duration, failures: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(failures.min(6)));
    let capped = exp.min(MAX_BACKOFF);
    let jitter_ms = rand::rng().random_range(0..=capped.as_millis() as u64 / 4 + 1);
    capped + Duration::from_millis(jitter_ms)
}
