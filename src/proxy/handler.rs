// Request pipeline: sanitize, resolve, select, rewrite, dispatch, observe.
//
// One handler is cloned per connection. Every path out of handle_request
// produces exactly one access-log record and one varz response sample,
// including early refusals.

use chrono::Utc;
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::upstream::{
    empty_body, full_body, spawn_tunnel, DispatchError, OutboundBody, ProxyBody, UpstreamClient,
};
use crate::access_log::{AccessLogRecord, AccessLogger};
use crate::config::ProxyConfig;
use crate::registry::RouteRegistry;
use crate::route::{normalize_host, Endpoint};
use crate::route_service::{self, RouteServiceSigner, VerifyError};
use crate::varz::Varz;

/// Cookie binding a client to one backend instance.
pub const STICKY_COOKIE: &str = "__VCAP_ID__";

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_VCAP_REQUEST_ID: HeaderName = HeaderName::from_static("x-vcap-request-id");

#[derive(Clone)]
pub struct ProxyHandler {
    registry: Arc<RouteRegistry>,
    upstream: UpstreamClient,
    signer: Option<Arc<RouteServiceSigner>>,
    access_log: AccessLogger,
    varz: Arc<Varz>,
    config: Arc<ProxyConfig>,
}

/// Finalizes the access record and varz sample when the response body
/// finishes (or is abandoned). Owned by the response body's frame mapper.
struct AccessFinalizer {
    record: AccessLogRecord,
    status: u16,
    started: Instant,
    bytes: Arc<AtomicU64>,
    access_log: AccessLogger,
    varz: Arc<Varz>,
    tags: HashMap<String, String>,
}

impl Drop for AccessFinalizer {
    fn drop(&mut self) {
        let latency = self.started.elapsed();
        self.record.status = self.status;
        self.record.bytes_written = self.bytes.load(Ordering::Relaxed);
        self.record.response_time_secs = latency.as_secs_f64();
        self.access_log.log(std::mem::take(&mut self.record));
        self.varz.record_response(self.status, latency, &self.tags);
    }
}

impl ProxyHandler {
    pub fn new(
        registry: Arc<RouteRegistry>,
        upstream: UpstreamClient,
        signer: Option<Arc<RouteServiceSigner>>,
        access_log: AccessLogger,
        varz: Arc<Varz>,
        config: Arc<ProxyConfig>,
    ) -> Self {
        Self {
            registry,
            upstream,
            signer,
            access_log,
            varz,
            config,
        }
    }

    pub async fn handle_request(
        &self,
        mut req: Request<Incoming>,
        remote_addr: SocketAddr,
        inbound_https: bool,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        self.varz.record_request();
        let started = Instant::now();

        let path_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let mut record = AccessLogRecord {
            started_at: Some(Utc::now()),
            method: req.method().to_string(),
            path: path_query.clone(),
            http_version: format!("{:?}", req.version()),
            client_addr: remote_addr.to_string(),
            referer: header_str(req.headers(), &header::REFERER),
            user_agent: header_str(req.headers(), &header::USER_AGENT),
            bytes_read: req.body().size_hint().exact().unwrap_or(0),
            ..Default::default()
        };
        for name in &self.config.extra_headers_to_log {
            let value = HeaderName::try_from(name.as_str())
                .ok()
                .and_then(|h| req.headers().get(&h))
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            record.extra_headers.push((name.clone(), value));
        }

        // Sanitize: a proxy without a Host has nowhere to route, and an
        // absolute-form target must agree with the Host header.
        let Some(host) = extract_host(&req) else {
            return Ok(self.refuse(
                record,
                started,
                StatusCode::BAD_REQUEST,
                "Bad Request: missing Host header",
            ));
        };
        record.host = host.clone();
        if let Some(uri_host) = req.uri().host() {
            if normalize_host(uri_host) != normalize_host(&host) {
                return Ok(self.refuse(
                    record,
                    started,
                    StatusCode::BAD_REQUEST,
                    "Bad Request: Host header does not match request target",
                ));
            }
        }

        let sticky = sticky_hint(req.headers());

        // Return leg of a route-service detour: verify the envelope and
        // aim the request back at the original route.
        let mut forwarded_target: Option<Uri> = None;
        if let Some(signer) = &self.signer {
            if req.headers().contains_key(route_service::SIGNATURE_HEADER) {
                let signature = header_str(req.headers(), &HeaderName::from_static("x-cf-proxy-signature"));
                let metadata = header_str(req.headers(), &HeaderName::from_static("x-cf-proxy-metadata"));
                match signer.verify(&signature, &metadata) {
                    Ok(envelope) => match envelope.forwarded_url.parse::<Uri>() {
                        Ok(uri) if uri.host().is_some() => {
                            debug!(forwarded_url = %envelope.forwarded_url, "Route service returned request");
                            forwarded_target = Some(uri);
                        }
                        _ => {
                            return Ok(self.refuse(
                                record,
                                started,
                                StatusCode::BAD_REQUEST,
                                "Bad Request: invalid forwarded URL",
                            ));
                        }
                    },
                    Err(VerifyError::Expired) => {
                        return Ok(self.refuse(
                            record,
                            started,
                            StatusCode::BAD_REQUEST,
                            "Bad Request: route service request expired",
                        ));
                    }
                    Err(VerifyError::Signature) => {
                        return Ok(self.refuse(
                            record,
                            started,
                            StatusCode::BAD_REQUEST,
                            "Bad Request: route service signature mismatch",
                        ));
                    }
                }
            }
        }

        let (lookup_host, lookup_path) = match &forwarded_target {
            Some(uri) => (uri.host().unwrap_or("").to_string(), uri.path().to_string()),
            None => (host.clone(), req.uri().path().to_string()),
        };

        // Resolve.
        let Some(found) = self.registry.lookup(&lookup_host, &lookup_path) else {
            info!(host = %lookup_host, path = %lookup_path, "No route registered");
            return Ok(self.refuse(
                record,
                started,
                StatusCode::NOT_FOUND,
                &format!("Requested route ('{}') does not exist.", lookup_host),
            ));
        };
        let pool = found.pool;

        // Select.
        let Some(endpoint) = pool.next(sticky.as_deref()) else {
            warn!(route = %found.matched_key, "Pool has no usable endpoints");
            return Ok(self.refuse(
                record,
                started,
                StatusCode::BAD_GATEWAY,
                "No healthy endpoints available",
            ));
        };
        record.backend_addr = endpoint.canonical_addr();
        record.app_id = endpoint.tags.get("app_id").cloned().unwrap_or_default();
        record.app_index = endpoint.tags.get("app_index").cloned().unwrap_or_default();

        let upgrading = wants_upgrade(req.headers());
        let client_upgrade = if upgrading {
            Some(hyper::upgrade::on(&mut req))
        } else {
            None
        };

        let (mut parts, body) = req.into_parts();
        adjust_headers(
            &mut parts.headers,
            remote_addr,
            inbound_https,
            upgrading,
            &self.config,
            &mut record,
        );

        // Tunnel mode: forward the upgrade handshake, then splice bytes.
        if upgrading {
            return Ok(self.handle_upgrade(
                parts.headers,
                parts.method,
                &endpoint,
                &pool,
                &path_query,
                client_upgrade.unwrap(),
                record,
                started,
            )
            .await);
        }

        // Outbound detour through a route service, unless this request just
        // came back from one.
        if forwarded_target.is_none() {
            if let Some(rs_url) = pool.route_service_url() {
                return Ok(self
                    .dispatch_route_service(
                        parts, body, rs_url, &host, &path_query, inbound_https, record, started,
                        endpoint.tags.clone(),
                    )
                    .await);
            }
        } else {
            parts.headers.remove(route_service::SIGNATURE_HEADER);
            parts.headers.remove(route_service::METADATA_HEADER);
            parts.headers.remove(route_service::FORWARDED_URL_HEADER);
        }

        let dispatch_path = match &forwarded_target {
            Some(uri) => uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            None => path_query.clone(),
        };

        // Dispatch with connection-level retries.
        let mut body = match OutboundBody::prepare(body, self.config.retry_buffer_limit).await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed reading client request body");
                return Ok(self.refuse(
                    record,
                    started,
                    StatusCode::BAD_REQUEST,
                    "Bad Request: body read failed",
                ));
            }
        };

        let mut endpoint = endpoint;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(attempt_body) = body.take() else {
                break;
            };
            let target = format!("http://{}{}", endpoint.canonical_addr(), dispatch_path);
            let uri: Uri = match target.parse() {
                Ok(uri) => uri,
                Err(e) => {
                    error!(error = %e, target = %target, "Invalid upstream target");
                    return Ok(self.refuse(
                        record,
                        started,
                        StatusCode::BAD_GATEWAY,
                        "Bad upstream address",
                    ));
                }
            };
            let outbound = build_request(&parts.method, uri, &parts.headers, attempt_body);

            match self.upstream.send(outbound).await {
                Ok(mut response) => {
                    self.maybe_set_sticky(response.headers_mut(), &endpoint);
                    return Ok(self.relay(response, record, started, endpoint.tags.clone()));
                }
                Err(err) if err.is_retryable() => {
                    warn!(
                        backend = %endpoint.canonical_addr(),
                        attempt,
                        error = %err,
                        "Connection-level failure, marking endpoint"
                    );
                    pool.mark_failed(&endpoint);
                    if body.is_replayable() && attempt < self.config.max_attempts {
                        match pool.next(None) {
                            Some(next) => {
                                endpoint = next;
                                record.backend_addr = endpoint.canonical_addr();
                                record.app_id =
                                    endpoint.tags.get("app_id").cloned().unwrap_or_default();
                                record.app_index =
                                    endpoint.tags.get("app_index").cloned().unwrap_or_default();
                                continue;
                            }
                            None => break,
                        }
                    }
                    break;
                }
                Err(DispatchError::Timeout) => {
                    warn!(backend = %endpoint.canonical_addr(), "Upstream round-trip timed out");
                    return Ok(self.refuse(
                        record,
                        started,
                        StatusCode::GATEWAY_TIMEOUT,
                        "Upstream request timed out",
                    ));
                }
                Err(err) => {
                    error!(backend = %endpoint.canonical_addr(), error = %err, "Upstream request failed");
                    return Ok(self.refuse(
                        record,
                        started,
                        StatusCode::BAD_GATEWAY,
                        "Backend request failed",
                    ));
                }
            }
        }

        Ok(self.refuse(
            record,
            started,
            StatusCode::BAD_GATEWAY,
            "No working endpoint after retries",
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_upgrade(
        &self,
        headers: HeaderMap,
        method: hyper::Method,
        endpoint: &Endpoint,
        pool: &crate::route::EndpointPool,
        path_query: &str,
        client_upgrade: hyper::upgrade::OnUpgrade,
        record: AccessLogRecord,
        started: Instant,
    ) -> Response<ProxyBody> {
        let target = format!("http://{}{}", endpoint.canonical_addr(), path_query);
        let uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(_) => {
                return self.refuse(record, started, StatusCode::BAD_GATEWAY, "Bad upstream address");
            }
        };
        let outbound = build_request(&method, uri, &headers, empty_body());

        // Tunnels live past any request budget, so the handshake itself is
        // not placed under the endpoint timeout either.
        match self.upstream.send_without_timeout(outbound).await {
            Ok(mut response) => {
                if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                    info!(backend = %endpoint.canonical_addr(), "Upgrade accepted, tunneling");
                    self.varz.record_tunnel();
                    let upstream_upgrade = hyper::upgrade::on(&mut response);
                    spawn_tunnel(client_upgrade, upstream_upgrade);
                }
                self.relay(response, record, started, endpoint.tags.clone())
            }
            Err(err) => {
                warn!(backend = %endpoint.canonical_addr(), error = %err, "Upgrade dispatch failed");
                pool.mark_failed(endpoint);
                self.refuse(record, started, StatusCode::BAD_GATEWAY, "Upgrade failed")
            }
        }
    }

    /// Send the request to the route's policy service with the signed
    /// envelope attached. One attempt; route services are not pool members.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_route_service(
        &self,
        mut parts: hyper::http::request::Parts,
        body: Incoming,
        rs_url: String,
        host: &str,
        path_query: &str,
        inbound_https: bool,
        mut record: AccessLogRecord,
        started: Instant,
        tags: HashMap<String, String>,
    ) -> Response<ProxyBody> {
        let Some(signer) = &self.signer else {
            return self.refuse(
                record,
                started,
                StatusCode::BAD_GATEWAY,
                "Route services are not enabled",
            );
        };

        if signer.recommend_https && route_service::insecure_downgrade(inbound_https, &rs_url) {
            warn!(route_service = %rs_url, "Refusing HTTP route service for HTTPS request");
            return self.refuse(
                record,
                started,
                StatusCode::BAD_GATEWAY,
                "Route service does not support HTTPS",
            );
        }

        let uri: Uri = match rs_url.parse() {
            Ok(uri) => uri,
            Err(e) => {
                error!(route_service = %rs_url, error = %e, "Invalid route service URL");
                return self.refuse(record, started, StatusCode::BAD_GATEWAY, "Bad route service URL");
            }
        };

        let scheme = if inbound_https { "https" } else { "http" };
        let original_url = format!("{}://{}{}", scheme, host, path_query);
        let (signature, metadata) = match signer.sign(&original_url) {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "Failed to sign route service envelope");
                return self.refuse(
                    record,
                    started,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Route service signing failed",
                );
            }
        };

        insert_str(&mut parts.headers, route_service::FORWARDED_URL_HEADER, &original_url);
        insert_str(&mut parts.headers, route_service::SIGNATURE_HEADER, &signature);
        insert_str(&mut parts.headers, route_service::METADATA_HEADER, &metadata);
        if let Some(authority) = uri.authority() {
            insert_str(&mut parts.headers, "host", authority.as_str());
        }
        record.backend_addr = uri.authority().map(|a| a.to_string()).unwrap_or_default();

        debug!(route_service = %rs_url, original = %original_url, "Diverting through route service");

        let outbound = build_request(&parts.method, uri, &parts.headers, body.boxed());
        match self.upstream.send(outbound).await {
            Ok(response) => self.relay(response, record, started, tags),
            Err(DispatchError::Timeout) => self.refuse(
                record,
                started,
                StatusCode::GATEWAY_TIMEOUT,
                "Route service timed out",
            ),
            Err(err) => {
                warn!(route_service = %rs_url, error = %err, "Route service request failed");
                self.refuse(
                    record,
                    started,
                    StatusCode::BAD_GATEWAY,
                    "Route service request failed",
                )
            }
        }
    }

    /// Stream an upstream response to the client, finalizing telemetry when
    /// the body completes.
    fn relay(
        &self,
        response: Response<Incoming>,
        mut record: AccessLogRecord,
        started: Instant,
        tags: HashMap<String, String>,
    ) -> Response<ProxyBody> {
        let (mut parts, body) = response.into_parts();
        let upgraded = parts.status == StatusCode::SWITCHING_PROTOCOLS;
        if !upgraded {
            strip_hop_headers(&mut parts.headers);
        }

        record.status = parts.status.as_u16();
        let bytes = Arc::new(AtomicU64::new(0));
        let finalizer = AccessFinalizer {
            status: parts.status.as_u16(),
            record,
            started,
            bytes: Arc::clone(&bytes),
            access_log: self.access_log.clone(),
            varz: Arc::clone(&self.varz),
            tags,
        };

        let counted = body
            .map_frame(move |frame| {
                let _finalize_on_drop = &finalizer;
                if let Some(data) = frame.data_ref() {
                    bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                frame
            })
            .boxed();

        Response::from_parts(parts, counted)
    }

    /// Terminal refusal: short diagnostic body, record logged immediately.
    fn refuse(
        &self,
        mut record: AccessLogRecord,
        started: Instant,
        status: StatusCode,
        message: &str,
    ) -> Response<ProxyBody> {
        let latency = started.elapsed();
        record.status = status.as_u16();
        record.bytes_written = message.len() as u64;
        record.response_time_secs = latency.as_secs_f64();
        self.access_log.log(record);
        self.varz.record_response(status.as_u16(), latency, &HashMap::new());
        if status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND {
            self.varz.record_bad_request();
        } else if status == StatusCode::BAD_GATEWAY {
            self.varz.record_bad_gateway();
        }

        let reason = match status.as_u16() {
            400 => "invalid_request",
            404 => "unknown_route",
            502 => "endpoint_failure",
            504 => "endpoint_timeout",
            _ => "router_error",
        };

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header("X-Cf-Routererror", reason)
            .body(full_body(message.to_string()))
            .unwrap()
    }

    fn maybe_set_sticky(&self, headers: &mut HeaderMap, endpoint: &Endpoint) {
        if endpoint.private_instance_id.is_empty() {
            return;
        }
        let triggered = headers.get_all(header::SET_COOKIE).iter().any(|value| {
            value
                .to_str()
                .ok()
                .and_then(|s| s.split('=').next())
                .map(|name| {
                    self.config
                        .sticky_trigger_cookies
                        .iter()
                        .any(|t| t.eq_ignore_ascii_case(name.trim()))
                })
                .unwrap_or(false)
        });
        if !triggered {
            return;
        }
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly",
            STICKY_COOKIE, endpoint.private_instance_id
        );
        if self.config.secure_cookies {
            cookie.push_str("; Secure");
        }
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            headers.append(header::SET_COOKIE, value);
        }
    }
}

fn build_request(
    method: &hyper::Method,
    uri: Uri,
    headers: &HeaderMap,
    body: ProxyBody,
) -> Request<ProxyBody> {
    let mut req = Request::builder()
        .method(method.clone())
        .uri(uri)
        .body(body)
        .expect("request construction from parsed parts");
    *req.headers_mut() = headers.clone();
    req
}

fn header_str(headers: &HeaderMap, name: &HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn insert_str(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::from_str(value)) {
        headers.insert(name, value);
    }
}

/// Host header first, URI authority second (absolute-form requests).
fn extract_host<T>(req: &Request<T>) -> Option<String> {
    if let Some(host) = req.headers().get(header::HOST) {
        if let Ok(host) = host.to_str() {
            if !host.is_empty() {
                return Some(host.to_string());
            }
        }
    }
    req.uri().host().map(|h| h.to_string())
}

/// Connection asks for an upgrade and names a protocol. Any token counts,
/// not just websocket.
fn wants_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    connection_upgrade && headers.contains_key(header::UPGRADE)
}

/// Pull the sticky hint out of the request cookies.
fn sticky_hint(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some(rest) = pair.trim().strip_prefix(STICKY_COOKIE) {
                if let Some(value) = rest.strip_prefix('=') {
                    if !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }
    }
    None
}

/// The forwarded request must not carry the router's own sticky cookie;
/// its value names a backend instance.
fn strip_sticky_cookie(headers: &mut HeaderMap) {
    let kept: Vec<String> = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .map(|pair| pair.trim())
        .filter(|pair| !pair.starts_with(&format!("{}=", STICKY_COOKIE)))
        .map(|pair| pair.to_string())
        .collect();

    headers.remove(header::COOKIE);
    if !kept.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&kept.join("; ")) {
            headers.insert(header::COOKIE, value);
        }
    }
}

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

fn strip_hop_headers(headers: &mut HeaderMap) {
    // Headers named by Connection are hop-scoped too.
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|raw| raw.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    for name in named {
        if let Ok(name) = HeaderName::try_from(name.as_str()) {
            headers.remove(name);
        }
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::UPGRADE);
}

/// Forwarding-header adjustments applied to the outbound header map.
fn adjust_headers(
    headers: &mut HeaderMap,
    remote_addr: SocketAddr,
    inbound_https: bool,
    upgrading: bool,
    config: &ProxyConfig,
    record: &mut AccessLogRecord,
) {
    // Append the client to the X-Forwarded-For chain.
    let client_ip = remote_addr.ip().to_string();
    let chain = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    record.x_forwarded_for = chain;

    // Scheme as seen at the edge, unless a trusted front end already said.
    let proto = if config.trust_frontend_proto {
        headers
            .get(&X_FORWARDED_PROTO)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| if inbound_https { "https" } else { "http" }.to_string())
    } else if inbound_https {
        "https".to_string()
    } else {
        "http".to_string()
    };
    if let Ok(value) = HeaderValue::from_str(&proto) {
        headers.insert(X_FORWARDED_PROTO, value);
    }
    record.x_forwarded_proto = proto;

    // Every request gets a correlation id exactly once.
    let request_id = match headers.get(&X_VCAP_REQUEST_ID).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => existing.to_string(),
        _ => Uuid::new_v4().to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_VCAP_REQUEST_ID, value);
    }
    record.vcap_request_id = request_id;

    if upgrading {
        // Keep the upgrade handshake intact; everything else hop-scoped
        // still goes.
        let upgrade = headers.get(header::UPGRADE).cloned();
        strip_hop_headers(headers);
        if let Some(upgrade) = upgrade {
            headers.insert(header::UPGRADE, upgrade);
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        }
    } else {
        strip_hop_headers(headers);
    }

    strip_sticky_cookie(headers);
}
