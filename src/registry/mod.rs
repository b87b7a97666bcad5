//! Concurrent route registry: host/prefix → endpoint pool.
//!
//! Registrations arrive from the pub-sub ingest and the routing-API fetcher
//! through the same idempotent interface; request workers resolve against it
//! on every request. The map is host-indexed so a lookup touches exactly one
//! shard entry, and each pool mutates under its own lock, so writers never
//! stall readers beyond a single pool-level update.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::route::{normalize_host, Endpoint, EndpointPool, EndpointSnapshot, RouteKey};

struct PrefixRoute {
    /// Path prefix, empty or starting with `/`. The list is kept ordered
    /// longest-first so the first match is the longest match.
    prefix: String,
    pool: Arc<EndpointPool>,
}

/// Result of a successful lookup.
pub struct RouteMatch {
    pub pool: Arc<EndpointPool>,
    /// The `host[/prefix]` key that matched, for telemetry.
    pub matched_key: String,
}

pub struct RouteRegistry {
    hosts: DashMap<String, Vec<PrefixRoute>>,
    failed_backoff: Duration,
}

impl RouteRegistry {
    pub fn new(failed_backoff: Duration) -> Self {
        Self {
            hosts: DashMap::new(),
            failed_backoff,
        }
    }

    /// Insert or refresh one endpoint under a route key. Idempotent on
    /// `(key, address, port)`.
    pub fn register(&self, key: &RouteKey, endpoint: Endpoint) {
        let mut entry = self.hosts.entry(key.host().to_string()).or_default();

        if let Some(route) = entry.iter().find(|r| r.prefix == key.path()) {
            let added = route.pool.put(endpoint);
            if added {
                debug!(key = %key, "Added endpoint to existing pool");
            }
            return;
        }

        let pool = Arc::new(EndpointPool::new(self.failed_backoff));
        pool.put(endpoint);
        let prefix = key.path().to_string();
        let at = entry
            .iter()
            .position(|r| r.prefix.len() < prefix.len())
            .unwrap_or(entry.len());
        entry.insert(
            at,
            PrefixRoute {
                prefix,
                pool,
            },
        );
        info!(key = %key, "Registered new route");
    }

    /// Remove one endpoint; pools emptied by the removal disappear with it.
    pub fn unregister(&self, key: &RouteKey, endpoint: &Endpoint) {
        let mut now_empty = false;
        if let Some(mut entry) = self.hosts.get_mut(key.host()) {
            if let Some(idx) = entry.iter().position(|r| r.prefix == key.path()) {
                if entry[idx].pool.remove(endpoint) {
                    debug!(key = %key, endpoint = %endpoint, "Unregistered endpoint");
                }
                if entry[idx].pool.is_empty() {
                    entry.remove(idx);
                    info!(key = %key, "Removed emptied route");
                }
            }
            now_empty = entry.is_empty();
        }
        if now_empty {
            self.hosts.remove_if(key.host(), |_, v| v.is_empty());
        }
    }

    /// Resolve a request host+path to the pool under the longest matching
    /// key. Exact hosts win over wildcards; among wildcards the longest
    /// fixed suffix wins. Pools whose members are all past TTL are treated
    /// as absent. Never fails; a miss is `None`.
    pub fn lookup(&self, host: &str, path: &str) -> Option<RouteMatch> {
        let host = normalize_host(host);

        if let Some(found) = self.lookup_host(&host, path) {
            return Some(found);
        }

        // Wildcard escalation: drop the leftmost label and retry under a
        // `*.` key until the domain is exhausted.
        let mut rest = host.as_str();
        while let Some(idx) = rest.find('.') {
            rest = &rest[idx + 1..];
            if rest.is_empty() {
                break;
            }
            let candidate = format!("*.{}", rest);
            if let Some(found) = self.lookup_host(&candidate, path) {
                return Some(found);
            }
        }
        None
    }

    fn lookup_host(&self, host_key: &str, path: &str) -> Option<RouteMatch> {
        let entry = self.hosts.get(host_key)?;
        for route in entry.iter() {
            if prefix_matches(&route.prefix, path) && route.pool.has_live_members() {
                return Some(RouteMatch {
                    pool: Arc::clone(&route.pool),
                    matched_key: format!("{}{}", host_key, route.prefix),
                });
            }
        }
        None
    }

    /// Sweep every pool, evicting endpoints past their TTL and dropping
    /// routes the sweep empties.
    pub fn prune_stale(&self) -> usize {
        let mut evicted = 0;
        let hosts: Vec<String> = self.hosts.iter().map(|e| e.key().clone()).collect();
        for host in hosts {
            let mut now_empty = false;
            if let Some(mut entry) = self.hosts.get_mut(&host) {
                for route in entry.iter() {
                    evicted += route.pool.prune_stale();
                }
                entry.retain(|r| !r.pool.is_empty());
                now_empty = entry.is_empty();
            }
            if now_empty {
                self.hosts.remove_if(&host, |_, v| v.is_empty());
            }
        }
        if evicted > 0 {
            info!(evicted, "Pruned stale endpoints");
        }
        evicted
    }

    /// Background TTL sweeper. Runs until the shutdown channel flips.
    pub fn start_pruner(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.prune_stale();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Route pruner stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Point-in-time copy for /routes and admin use.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<EndpointSnapshot>> {
        let mut out = BTreeMap::new();
        for entry in self.hosts.iter() {
            for route in entry.value().iter() {
                let key = format!("{}{}", entry.key(), route.prefix);
                out.insert(key, route.pool.snapshot());
            }
        }
        out
    }

    /// (route count, endpoint count) for gauges.
    pub fn counts(&self) -> (usize, usize) {
        let mut routes = 0;
        let mut endpoints = 0;
        for entry in self.hosts.iter() {
            for route in entry.value().iter() {
                routes += 1;
                endpoints += route.pool.len();
            }
        }
        (routes, endpoints)
    }
}

/// Segment-boundary prefix match: `/api` covers `/api`, `/api/`, and
/// `/api/v1`, but not `/apikeys`. The empty prefix covers every path.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    if path == prefix {
        return true;
    }
    if let Some(rest) = path.strip_prefix(prefix) {
        return rest.starts_with('/');
    }
    false
}
