// Endpoint pool: the set of backends registered under one route key, plus
// the round-robin and failure state used for selection.

use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::Endpoint;

struct Member {
    endpoint: Endpoint,
    registered_at: Instant,
    failed_at: Option<Instant>,
}

impl Member {
    fn is_stale(&self, now: Instant) -> bool {
        now.duration_since(self.registered_at) > self.endpoint.stale_threshold
    }

    fn is_failed(&self, now: Instant, backoff: Duration) -> bool {
        match self.failed_at {
            Some(at) => now.duration_since(at) < backoff,
            None => false,
        }
    }
}

struct PoolInner {
    members: Vec<Member>,
    cursor: usize,
    route_service_url: Option<String>,
}

/// Point-in-time view of one registered endpoint, for /routes and varz.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub address: String,
    pub port: u16,
    pub private_instance_id: String,
    pub tags: std::collections::HashMap<String, String>,
    pub route_service_url: Option<String>,
    pub ttl_secs: u64,
    pub age_secs: u64,
}

/// The backends sharing one route key. All mutation happens under one
/// pool-level lock, independent of the registry map.
pub struct EndpointPool {
    inner: Mutex<PoolInner>,
    failed_backoff: Duration,
}

impl EndpointPool {
    pub fn new(failed_backoff: Duration) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                members: Vec::new(),
                cursor: 0,
                route_service_url: None,
            }),
            failed_backoff,
        }
    }

    /// Insert or refresh. Returns true when a new member was added.
    /// Re-registration overwrites metadata, refreshes the registration
    /// timestamp, and clears any failure mark. The pool's route-service URL
    /// follows the most recent registration, including going back to None.
    pub fn put(&self, endpoint: Endpoint) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.route_service_url = endpoint.route_service_url.clone();

        if let Some(member) = inner
            .members
            .iter_mut()
            .find(|m| m.endpoint.same_instance(&endpoint))
        {
            member.endpoint = endpoint;
            member.registered_at = Instant::now();
            member.failed_at = None;
            return false;
        }

        inner.members.push(Member {
            endpoint,
            registered_at: Instant::now(),
            failed_at: None,
        });
        true
    }

    /// Remove one endpoint by identity. Returns true when it was present.
    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.members.len();
        inner.members.retain(|m| !m.endpoint.same_instance(endpoint));
        inner.members.len() != before
    }

    /// Pick a backend. A sticky hint naming a present, unfailed, unexpired
    /// instance wins; otherwise round-robin over healthy members. When every
    /// live member is marked failed the marks are cleared so one gets probed.
    pub fn next(&self, sticky_hint: Option<&str>) -> Option<Endpoint> {
        let now = Instant::now();
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let backoff = self.failed_backoff;

        if let Some(hint) = sticky_hint {
            if !hint.is_empty() {
                if let Some(member) = inner.members.iter().find(|m| {
                    m.endpoint.private_instance_id == hint
                        && !m.is_stale(now)
                        && !m.is_failed(now, backoff)
                }) {
                    return Some(member.endpoint.clone());
                }
            }
        }

        let len = inner.members.len();
        if len == 0 {
            return None;
        }

        for offset in 0..len {
            let idx = (inner.cursor + offset) % len;
            let member = &inner.members[idx];
            if member.is_stale(now) || member.is_failed(now, backoff) {
                continue;
            }
            inner.cursor = (idx + 1) % len;
            return Some(member.endpoint.clone());
        }

        // Everything live is marked failed: clear the marks and hand out the
        // round-robin pick so traffic probes for recovery.
        let any_live = inner.members.iter().any(|m| !m.is_stale(now));
        if !any_live {
            return None;
        }
        for member in inner.members.iter_mut() {
            member.failed_at = None;
        }
        for offset in 0..len {
            let idx = (inner.cursor + offset) % len;
            if inner.members[idx].is_stale(now) {
                continue;
            }
            inner.cursor = (idx + 1) % len;
            return Some(inner.members[idx].endpoint.clone());
        }
        None
    }

    /// Record a transient failure. Advisory: selection skips the member
    /// until the backoff elapses.
    pub fn mark_failed(&self, endpoint: &Endpoint) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(member) = inner
            .members
            .iter_mut()
            .find(|m| m.endpoint.same_instance(endpoint))
        {
            member.failed_at = Some(Instant::now());
        }
    }

    /// Drop members whose registration has outlived its TTL. Returns how
    /// many were evicted.
    pub fn prune_stale(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let before = inner.members.len();
        inner.members.retain(|m| !m.is_stale(now));
        if inner.cursor >= inner.members.len() {
            inner.cursor = 0;
        }
        before - inner.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().members.len()
    }

    /// True when at least one member is within its TTL.
    pub fn has_live_members(&self) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .unwrap()
            .members
            .iter()
            .any(|m| !m.is_stale(now))
    }

    pub fn route_service_url(&self) -> Option<String> {
        self.inner.lock().unwrap().route_service_url.clone()
    }

    pub fn snapshot(&self) -> Vec<EndpointSnapshot> {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        inner
            .members
            .iter()
            .map(|m| EndpointSnapshot {
                address: m.endpoint.address.clone(),
                port: m.endpoint.port,
                private_instance_id: m.endpoint.private_instance_id.clone(),
                tags: m.endpoint.tags.clone(),
                route_service_url: m.endpoint.route_service_url.clone(),
                ttl_secs: m.endpoint.stale_threshold.as_secs(),
                age_secs: now.duration_since(m.registered_at).as_secs(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool() -> EndpointPool {
        EndpointPool::new(Duration::from_secs(30))
    }

    #[test]
    fn put_is_idempotent_on_identity() {
        let p = pool();
        assert!(p.put(Endpoint::new("10.0.0.1", 8080).with_instance_id("a1")));
        assert!(!p.put(Endpoint::new("10.0.0.1", 8080).with_instance_id("a2")));
        assert_eq!(p.len(), 1);

        // metadata follows the latest registration
        let picked = p.next(None).unwrap();
        assert_eq!(picked.private_instance_id, "a2");
    }

    #[test]
    fn remove_then_empty() {
        let p = pool();
        let e = Endpoint::new("10.0.0.1", 8080);
        p.put(e.clone());
        assert!(p.remove(&e));
        assert!(!p.remove(&e));
        assert!(p.is_empty());
        assert!(p.next(None).is_none());
    }

    #[test]
    fn round_robin_cycles_members() {
        let p = pool();
        p.put(Endpoint::new("10.0.0.1", 8080));
        p.put(Endpoint::new("10.0.0.2", 8080));

        let first = p.next(None).unwrap();
        let second = p.next(None).unwrap();
        let third = p.next(None).unwrap();
        assert_ne!(first.canonical_addr(), second.canonical_addr());
        assert_eq!(first.canonical_addr(), third.canonical_addr());
    }

    #[test]
    fn sticky_hint_overrides_cursor() {
        let p = pool();
        p.put(Endpoint::new("10.0.0.1", 8080).with_instance_id("a1"));
        p.put(Endpoint::new("10.0.0.2", 8080).with_instance_id("b1"));

        for _ in 0..5 {
            let picked = p.next(Some("b1")).unwrap();
            assert_eq!(picked.private_instance_id, "b1");
        }
    }

    #[test]
    fn unknown_sticky_hint_falls_back_to_round_robin() {
        let p = pool();
        p.put(Endpoint::new("10.0.0.1", 8080).with_instance_id("a1"));
        let picked = p.next(Some("nope")).unwrap();
        assert_eq!(picked.private_instance_id, "a1");
    }

    #[test]
    fn failed_members_are_skipped() {
        let p = pool();
        let a = Endpoint::new("10.0.0.1", 8080).with_instance_id("a1");
        let b = Endpoint::new("10.0.0.2", 8080).with_instance_id("b1");
        p.put(a.clone());
        p.put(b);

        p.mark_failed(&a);
        for _ in 0..4 {
            let picked = p.next(None).unwrap();
            assert_eq!(picked.private_instance_id, "b1");
        }
    }

    #[test]
    fn sticky_hint_ignores_failed_member() {
        let p = pool();
        let a = Endpoint::new("10.0.0.1", 8080).with_instance_id("a1");
        p.put(a.clone());
        p.put(Endpoint::new("10.0.0.2", 8080).with_instance_id("b1"));

        p.mark_failed(&a);
        let picked = p.next(Some("a1")).unwrap();
        assert_eq!(picked.private_instance_id, "b1");
    }

    #[test]
    fn all_failed_clears_marks_and_probes() {
        let p = pool();
        let a = Endpoint::new("10.0.0.1", 8080);
        let b = Endpoint::new("10.0.0.2", 8080);
        p.put(a.clone());
        p.put(b.clone());
        p.mark_failed(&a);
        p.mark_failed(&b);

        assert!(p.next(None).is_some());
        // marks were cleared, both rotate again
        let x = p.next(None).unwrap();
        let y = p.next(None).unwrap();
        assert_ne!(x.canonical_addr(), y.canonical_addr());
    }

    #[test]
    fn reregistration_clears_failure_mark() {
        let p = pool();
        let a = Endpoint::new("10.0.0.1", 8080).with_instance_id("a1");
        p.put(a.clone());
        p.mark_failed(&a);
        p.put(a.clone());
        let picked = p.next(None).unwrap();
        assert_eq!(picked.private_instance_id, "a1");
    }

    #[test]
    fn stale_members_are_invisible_and_pruned() {
        let p = pool();
        let e = Endpoint::new("10.0.0.1", 8080)
            .with_stale_threshold(Duration::from_millis(10));
        p.put(e);
        std::thread::sleep(Duration::from_millis(25));

        assert!(p.next(None).is_none());
        assert!(!p.has_live_members());
        assert_eq!(p.prune_stale(), 1);
        assert!(p.is_empty());
    }

    #[test]
    fn route_service_url_follows_latest_registration() {
        let p = pool();
        p.put(Endpoint::new("10.0.0.1", 8080).with_route_service_url("https://rs.example.com"));
        assert_eq!(
            p.route_service_url().as_deref(),
            Some("https://rs.example.com")
        );

        p.put(Endpoint::new("10.0.0.2", 8080));
        assert_eq!(p.route_service_url(), None);
    }
}
