//! In-process request telemetry: counters, latency histogram, bounded
//! per-tag counts, and the JSON snapshot served on /varz. Counter updates
//! are mirrored to the `metrics` facade so the Prometheus exporter sees the
//! same numbers.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const REQUESTS_TOTAL: &str = "router_requests_total";
pub const RESPONSES_TOTAL: &str = "router_responses_total";
pub const REQUEST_LATENCY_SECONDS: &str = "router_request_latency_seconds";
pub const ROUTES_REGISTERED: &str = "router_routes_registered";
pub const ENDPOINTS_REGISTERED: &str = "router_endpoints_registered";
pub const BAD_REQUESTS_TOTAL: &str = "router_bad_requests_total";
pub const BAD_GATEWAYS_TOTAL: &str = "router_bad_gateways_total";

/// Distinct values tracked per tag name before the remainder collapses
/// into `_other`.
const TAG_TOP_K: usize = 50;

const DEFAULT_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Register metric descriptions with the installed recorder. Call once at
/// startup after the Prometheus recorder is installed.
pub fn describe_metrics() {
    describe_counter!(REQUESTS_TOTAL, "Total requests accepted by the proxy");
    describe_counter!(RESPONSES_TOTAL, "Responses by status class");
    describe_histogram!(REQUEST_LATENCY_SECONDS, "Whole-request latency in seconds");
    describe_gauge!(ROUTES_REGISTERED, "Route keys currently registered");
    describe_gauge!(ENDPOINTS_REGISTERED, "Backend endpoints currently registered");
    describe_counter!(BAD_REQUESTS_TOTAL, "Requests refused before dispatch");
    describe_counter!(BAD_GATEWAYS_TOTAL, "Requests that exhausted their pool");
}

struct LatencyHistogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    total: AtomicU64,
}

impl LatencyHistogram {
    fn new(buckets: Vec<f64>) -> Self {
        let counts = (0..buckets.len() + 1).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_micros: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    fn observe(&self, latency: Duration) {
        let secs = latency.as_secs_f64();
        let idx = self
            .buckets
            .iter()
            .position(|b| secs <= *b)
            .unwrap_or(self.buckets.len());
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let mut buckets = Vec::with_capacity(self.buckets.len() + 1);
        for (i, bound) in self.buckets.iter().enumerate() {
            buckets.push(BucketSnapshot {
                le: bound.to_string(),
                count: self.counts[i].load(Ordering::Relaxed),
            });
        }
        buckets.push(BucketSnapshot {
            le: "+Inf".to_string(),
            count: self.counts[self.buckets.len()].load(Ordering::Relaxed),
        });
        HistogramSnapshot {
            buckets,
            sum_seconds: self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6,
            count: self.total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BucketSnapshot {
    pub le: String,
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<BucketSnapshot>,
    pub sum_seconds: f64,
    pub count: u64,
}

pub struct Varz {
    started_at: Instant,
    requests: AtomicU64,
    responses_1xx: AtomicU64,
    responses_2xx: AtomicU64,
    responses_3xx: AtomicU64,
    responses_4xx: AtomicU64,
    responses_5xx: AtomicU64,
    bad_requests: AtomicU64,
    bad_gateways: AtomicU64,
    tunnels: AtomicU64,
    latency: LatencyHistogram,
    tag_counts: Mutex<HashMap<String, HashMap<String, u64>>>,
}

impl Varz {
    pub fn new() -> Self {
        Self::with_buckets(DEFAULT_BUCKETS.to_vec())
    }

    pub fn with_buckets(buckets: Vec<f64>) -> Self {
        Self {
            started_at: Instant::now(),
            requests: AtomicU64::new(0),
            responses_1xx: AtomicU64::new(0),
            responses_2xx: AtomicU64::new(0),
            responses_3xx: AtomicU64::new(0),
            responses_4xx: AtomicU64::new(0),
            responses_5xx: AtomicU64::new(0),
            bad_requests: AtomicU64::new(0),
            bad_gateways: AtomicU64::new(0),
            tunnels: AtomicU64::new(0),
            latency: LatencyHistogram::new(buckets),
            tag_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        counter!(REQUESTS_TOTAL).increment(1);
    }

    pub fn record_response(
        &self,
        status: u16,
        latency: Duration,
        tags: &HashMap<String, String>,
    ) {
        let class = match status {
            100..=199 => &self.responses_1xx,
            200..=299 => &self.responses_2xx,
            300..=399 => &self.responses_3xx,
            400..=499 => &self.responses_4xx,
            _ => &self.responses_5xx,
        };
        class.fetch_add(1, Ordering::Relaxed);
        self.latency.observe(latency);

        let class_label = format!("{}xx", status / 100);
        counter!(RESPONSES_TOTAL, "class" => class_label).increment(1);
        histogram!(REQUEST_LATENCY_SECONDS).record(latency.as_secs_f64());

        if !tags.is_empty() {
            let mut counts = self.tag_counts.lock().unwrap();
            for (name, value) in tags {
                let per_tag = counts.entry(name.clone()).or_default();
                if per_tag.len() >= TAG_TOP_K && !per_tag.contains_key(value) {
                    *per_tag.entry("_other".to_string()).or_insert(0) += 1;
                } else {
                    *per_tag.entry(value.clone()).or_insert(0) += 1;
                }
            }
        }
    }

    pub fn record_bad_request(&self) {
        self.bad_requests.fetch_add(1, Ordering::Relaxed);
        counter!(BAD_REQUESTS_TOTAL).increment(1);
    }

    pub fn record_bad_gateway(&self) {
        self.bad_gateways.fetch_add(1, Ordering::Relaxed);
        counter!(BAD_GATEWAYS_TOTAL).increment(1);
    }

    pub fn record_tunnel(&self) {
        self.tunnels.fetch_add(1, Ordering::Relaxed);
    }

    /// Push current registry sizes to the gauge metrics.
    pub fn update_registry_gauges(&self, routes: usize, endpoints: usize) {
        gauge!(ROUTES_REGISTERED).set(routes as f64);
        gauge!(ENDPOINTS_REGISTERED).set(endpoints as f64);
    }

    pub fn snapshot(&self, routes: usize, endpoints: usize) -> VarzSnapshot {
        VarzSnapshot {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            requests: self.requests.load(Ordering::Relaxed),
            responses_1xx: self.responses_1xx.load(Ordering::Relaxed),
            responses_2xx: self.responses_2xx.load(Ordering::Relaxed),
            responses_3xx: self.responses_3xx.load(Ordering::Relaxed),
            responses_4xx: self.responses_4xx.load(Ordering::Relaxed),
            responses_5xx: self.responses_5xx.load(Ordering::Relaxed),
            bad_requests: self.bad_requests.load(Ordering::Relaxed),
            bad_gateways: self.bad_gateways.load(Ordering::Relaxed),
            tunnels: self.tunnels.load(Ordering::Relaxed),
            routes_registered: routes,
            endpoints_registered: endpoints,
            latency: self.latency.snapshot(),
            tags: self.tag_counts.lock().unwrap().clone(),
        }
    }
}

impl Default for Varz {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct VarzSnapshot {
    pub uptime_seconds: u64,
    pub requests: u64,
    pub responses_1xx: u64,
    pub responses_2xx: u64,
    pub responses_3xx: u64,
    pub responses_4xx: u64,
    pub responses_5xx: u64,
    pub bad_requests: u64,
    pub bad_gateways: u64,
    pub tunnels: u64,
    pub routes_registered: usize,
    pub endpoints_registered: usize,
    pub latency: HistogramSnapshot,
    pub tags: HashMap<String, HashMap<String, u64>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes_are_counted() {
        let varz = Varz::new();
        let tags = HashMap::new();
        varz.record_request();
        varz.record_response(200, Duration::from_millis(3), &tags);
        varz.record_response(201, Duration::from_millis(3), &tags);
        varz.record_response(404, Duration::from_millis(3), &tags);
        varz.record_response(502, Duration::from_millis(3), &tags);

        let snap = varz.snapshot(0, 0);
        assert_eq!(snap.requests, 1);
        assert_eq!(snap.responses_2xx, 2);
        assert_eq!(snap.responses_4xx, 1);
        assert_eq!(snap.responses_5xx, 1);
        assert_eq!(snap.latency.count, 4);
    }

    #[test]
    fn latency_lands_in_the_right_bucket() {
        let varz = Varz::with_buckets(vec![0.01, 0.1, 1.0]);
        let tags = HashMap::new();
        varz.record_response(200, Duration::from_millis(50), &tags);

        let snap = varz.snapshot(0, 0);
        assert_eq!(snap.latency.buckets[0].count, 0); // <= 10ms
        assert_eq!(snap.latency.buckets[1].count, 1); // <= 100ms
        assert_eq!(snap.latency.buckets[2].count, 0);
    }

    #[test]
    fn tag_counts_are_bounded() {
        let varz = Varz::new();
        for i in 0..(TAG_TOP_K + 10) {
            let mut tags = HashMap::new();
            tags.insert("app_id".to_string(), format!("app-{}", i));
            varz.record_response(200, Duration::from_millis(1), &tags);
        }

        let snap = varz.snapshot(0, 0);
        let per_tag = &snap.tags["app_id"];
        assert!(per_tag.len() <= TAG_TOP_K + 1);
        assert_eq!(per_tag["_other"], 10);
    }
}
