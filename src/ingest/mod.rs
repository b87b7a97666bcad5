//! Pub-sub route ingest.
//!
//! Producers announce their backends on `router.register` /
//! `router.unregister`; the router applies each message through the
//! registry's idempotent interface. On startup (and periodically after) the
//! router publishes `router.start`, prompting producers to re-advertise.
//! This is how route state survives a router restart without persistence.

pub mod nats;

pub use nats::NatsBus;

use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::RouteRegistry;
use crate::route::{Endpoint, RouteKey};

pub const REGISTER_SUBJECT: &str = "router.register";
pub const UNREGISTER_SUBJECT: &str = "router.unregister";
pub const START_SUBJECT: &str = "router.start";

/// One message off the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Narrow contract against the external pub-sub client. Subscriptions are
/// channels the implementation keeps fed (reconnecting as needed); publish
/// is fire-and-forget.
pub trait MessageBus: Send + Sync + 'static {
    fn subscribe(&self, subject: &str) -> mpsc::Receiver<BusMessage>;
    fn publish(&self, subject: &str, payload: Vec<u8>);
}

/// The register/unregister payload. Producers historically put the backend
/// address under `host`; both spellings are accepted. Unknown fields are
/// ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteMessage {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    pub uris: Vec<String>,
    pub port: u16,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub private_instance_id: String,
    #[serde(default)]
    pub stale_threshold: Option<u64>,
    #[serde(default)]
    pub route_service_url: Option<String>,
}

impl RouteMessage {
    fn backend_address(&self) -> Option<&str> {
        self.address.as_deref().or(self.host.as_deref())
    }
}

pub struct SubscriptionIngest {
    registry: Arc<RouteRegistry>,
    default_stale_threshold: Duration,
}

impl SubscriptionIngest {
    pub fn new(registry: Arc<RouteRegistry>, default_stale_threshold: Duration) -> Self {
        Self {
            registry,
            default_stale_threshold,
        }
    }

    /// Subscribe and apply until shutdown. Also announces `router.start`
    /// immediately and on every interval tick.
    pub fn start(
        self,
        bus: Arc<dyn MessageBus>,
        start_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let mut registers = bus.subscribe(REGISTER_SUBJECT);
        let mut unregisters = bus.subscribe(UNREGISTER_SUBJECT);

        tokio::spawn(async move {
            let router_id = Uuid::new_v4().to_string();
            announce_start(bus.as_ref(), &router_id, start_interval);
            let mut announce = tokio::time::interval(start_interval);
            announce.tick().await; // the immediate tick; the announcement above covered it

            info!("Subscription ingest started");
            loop {
                tokio::select! {
                    message = registers.recv() => {
                        match message {
                            Some(message) => self.apply_register(&message.payload),
                            None => {
                                warn!("Register subscription closed");
                                return;
                            }
                        }
                    }
                    message = unregisters.recv() => {
                        match message {
                            Some(message) => self.apply_unregister(&message.payload),
                            None => {
                                warn!("Unregister subscription closed");
                                return;
                            }
                        }
                    }
                    _ = announce.tick() => {
                        announce_start(bus.as_ref(), &router_id, start_interval);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Subscription ingest stopping");
                            return;
                        }
                    }
                }
            }
        })
    }

    fn parse(&self, payload: &[u8]) -> Option<(RouteMessage, Vec<RouteKey>, Endpoint)> {
        let message: RouteMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed route message");
                return None;
            }
        };
        let Some(address) = message.backend_address() else {
            warn!("Dropping route message without a backend address");
            return None;
        };
        if message.uris.is_empty() {
            warn!("Dropping route message without uris");
            return None;
        }

        let mut keys = Vec::with_capacity(message.uris.len());
        for uri in &message.uris {
            match RouteKey::parse(uri) {
                Ok(key) => keys.push(key),
                Err(e) => warn!(uri = %uri, error = %e, "Skipping malformed uri in route message"),
            }
        }
        if keys.is_empty() {
            return None;
        }

        let ttl = message
            .stale_threshold
            .map(Duration::from_secs)
            .unwrap_or(self.default_stale_threshold);
        let mut endpoint = Endpoint::new(address, message.port).with_stale_threshold(ttl);
        endpoint.private_instance_id = message.private_instance_id.clone();
        endpoint.tags = message.tags.clone();
        endpoint.route_service_url = message.route_service_url.clone();

        Some((message, keys, endpoint))
    }

    fn apply_register(&self, payload: &[u8]) {
        if let Some((_message, keys, endpoint)) = self.parse(payload) {
            for key in keys {
                self.registry.register(&key, endpoint.clone());
            }
        }
    }

    fn apply_unregister(&self, payload: &[u8]) {
        if let Some((_message, keys, endpoint)) = self.parse(payload) {
            for key in keys {
                self.registry.unregister(&key, &endpoint);
            }
        }
    }
}

fn announce_start(bus: &dyn MessageBus, router_id: &str, interval: Duration) {
    let payload = json!({
        "id": router_id,
        "minimum_register_interval_in_seconds": interval.as_secs(),
    });
    debug!(router_id, "Announcing router.start");
    bus.publish(START_SUBJECT, payload.to_string().into_bytes());
}

/// Process-local bus used by tests (and anything embedding the router).
#[derive(Default)]
pub struct InMemoryBus {
    subscribers: std::sync::Mutex<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageBus for InMemoryBus {
    fn subscribe(&self, subject: &str) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(1024);
        self.subscribers
            .lock()
            .unwrap()
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn publish(&self, subject: &str, payload: Vec<u8>) {
        let subscribers = self.subscribers.lock().unwrap();
        if let Some(list) = subscribers.get(subject) {
            for tx in list {
                let _ = tx.try_send(BusMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<RouteRegistry> {
        Arc::new(RouteRegistry::new(Duration::from_secs(30)))
    }

    fn start_ingest(
        registry: Arc<RouteRegistry>,
        bus: Arc<InMemoryBus>,
    ) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let ingest = SubscriptionIngest::new(registry, Duration::from_secs(120));
        let (tx, rx) = watch::channel(false);
        let handle = ingest.start(bus, Duration::from_secs(60), rx);
        (tx, handle)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn register_message_populates_registry() {
        let registry = registry();
        let bus = Arc::new(InMemoryBus::new());
        let (_tx, _handle) = start_ingest(Arc::clone(&registry), Arc::clone(&bus));

        bus.publish(
            REGISTER_SUBJECT,
            serde_json::to_vec(&json!({
                "host": "10.0.0.1",
                "port": 8080,
                "uris": ["foo.example.com", "foo.example.com/api"],
                "private_instance_id": "inst-1",
                "tags": {"app_id": "a-1"},
                "stale_threshold": 120
            }))
            .unwrap(),
        );
        settle().await;

        assert_eq!(registry.counts(), (2, 2));
        let found = registry.lookup("foo.example.com", "/api/x").unwrap();
        assert_eq!(found.matched_key, "foo.example.com/api");
    }

    #[tokio::test]
    async fn unregister_message_removes_routes() {
        let registry = registry();
        let bus = Arc::new(InMemoryBus::new());
        let (_tx, _handle) = start_ingest(Arc::clone(&registry), Arc::clone(&bus));

        let payload = serde_json::to_vec(&json!({
            "host": "10.0.0.1",
            "port": 8080,
            "uris": ["foo.example.com"]
        }))
        .unwrap();

        bus.publish(REGISTER_SUBJECT, payload.clone());
        settle().await;
        assert_eq!(registry.counts(), (1, 1));

        bus.publish(UNREGISTER_SUBJECT, payload);
        settle().await;
        assert_eq!(registry.counts(), (0, 0));
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped() {
        let registry = registry();
        let bus = Arc::new(InMemoryBus::new());
        let (_tx, _handle) = start_ingest(Arc::clone(&registry), Arc::clone(&bus));

        bus.publish(REGISTER_SUBJECT, b"not json".to_vec());
        bus.publish(
            REGISTER_SUBJECT,
            serde_json::to_vec(&json!({"port": 8080, "uris": ["x.example.com"]})).unwrap(),
        );
        bus.publish(
            REGISTER_SUBJECT,
            serde_json::to_vec(&json!({"host": "10.0.0.1", "port": 8080, "uris": []})).unwrap(),
        );
        settle().await;

        assert_eq!(registry.counts(), (0, 0));
    }

    #[tokio::test]
    async fn unknown_fields_are_ignored() {
        let registry = registry();
        let bus = Arc::new(InMemoryBus::new());
        let (_tx, _handle) = start_ingest(Arc::clone(&registry), Arc::clone(&bus));

        bus.publish(
            REGISTER_SUBJECT,
            serde_json::to_vec(&json!({
                "host": "10.0.0.1",
                "port": 8080,
                "uris": ["foo.example.com"],
                "some_future_field": {"nested": true}
            }))
            .unwrap(),
        );
        settle().await;
        assert_eq!(registry.counts(), (1, 1));
    }

    #[tokio::test]
    async fn missing_ttl_gets_the_default() {
        let registry = registry();
        let ingest = SubscriptionIngest::new(Arc::clone(&registry), Duration::from_millis(10));
        ingest.apply_register(
            &serde_json::to_vec(&json!({
                "host": "10.0.0.1",
                "port": 8080,
                "uris": ["ttl.example.com"]
            }))
            .unwrap(),
        );
        assert!(registry.lookup("ttl.example.com", "/").is_some());

        // default TTL came from the ingest, not the endpoint builder default
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(registry.lookup("ttl.example.com", "/").is_none());
    }

    #[tokio::test]
    async fn start_announcement_is_published() {
        let registry = registry();
        let bus = Arc::new(InMemoryBus::new());
        let mut starts = bus.subscribe(START_SUBJECT);
        let (_tx, _handle) = start_ingest(registry, Arc::clone(&bus));

        let message = tokio::time::timeout(Duration::from_secs(1), starts.recv())
            .await
            .expect("router.start not announced")
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
        assert!(value.get("id").is_some());
        assert_eq!(value["minimum_register_interval_in_seconds"], 60);
    }
}
