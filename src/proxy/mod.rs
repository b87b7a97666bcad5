// Proxy front end: the accept loops feeding connections into the request
// pipeline, and the drain bookkeeping used at shutdown.

pub mod handler;
pub mod upstream;

pub use handler::{ProxyHandler, STICKY_COOKIE};
pub use upstream::{ProxyBody, UpstreamClient};

use anyhow::{Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Connections currently being served; graceful drain waits on this.
#[derive(Clone, Default)]
pub struct InflightCounter(Arc<AtomicUsize>);

impl InflightCounter {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn guard(&self) -> InflightGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        InflightGuard(Arc::clone(&self.0))
    }

    /// Wait until all in-flight connections finish, or the timeout expires.
    /// Returns true on a clean drain.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

struct InflightGuard(Arc<AtomicUsize>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Accept loop for one listener. Each connection runs in its own task and
/// serves any number of http1 requests (with upgrade support).
pub struct ProxyServer {
    handler: ProxyHandler,
    shutdown: watch::Receiver<bool>,
    inflight: InflightCounter,
    tls: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(handler: ProxyHandler, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            handler,
            shutdown,
            inflight: InflightCounter::default(),
            tls: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn inflight(&self) -> InflightCounter {
        self.inflight.clone()
    }

    /// Serve until shutdown flips. Binding happens in the caller so a bind
    /// failure stays a startup fatal.
    pub async fn run(mut self, listener: TcpListener) -> Result<()> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let addr = listener.local_addr().context("listener has no local addr")?;
        info!(addr = %addr, scheme, "Proxy listener started");

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!(scheme, "Proxy listener stopped accepting");
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            self.spawn_connection(stream, remote_addr);
                        }
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                        }
                    }
                }
            }
        }
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, remote_addr: SocketAddr) {
        let handler = self.handler.clone();
        let guard = self.inflight.guard();
        let tls = self.tls.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let result = match tls {
                None => serve_stream(stream, remote_addr, handler, false).await,
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => serve_stream(tls_stream, remote_addr, handler, true).await,
                    Err(e) => {
                        debug!(error = %e, remote = %remote_addr, "TLS handshake failed");
                        Ok(())
                    }
                },
            };
            if let Err(e) = result {
                debug!(error = %e, remote = %remote_addr, "Connection ended with error");
            }
        });
    }
}

async fn serve_stream<S>(
    stream: S,
    remote_addr: SocketAddr,
    handler: ProxyHandler,
    https: bool,
) -> std::result::Result<(), hyper::Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    http1::Builder::new()
        .serve_connection(
            io,
            service_fn(move |req| {
                let handler = handler.clone();
                async move { handler.handle_request(req, remote_addr, https).await }
            }),
        )
        .with_upgrades()
        .await
}

/// Build the HTTPS acceptor from the configured certificate pair, honoring
/// a cipher-suite allowlist when one is set.
pub fn tls_acceptor(
    cert_path: &Path,
    key_path: &Path,
    cipher_suites: &[String],
) -> Result<TlsAcceptor> {
    let chain = read_cert_chain(cert_path)?;
    let key = read_key(key_path)?;

    let provider = if cipher_suites.is_empty() {
        rustls::crypto::aws_lc_rs::default_provider()
    } else {
        restricted_provider(cipher_suites)?
    };
    let config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .context("No protocol versions usable with configured cipher suites")?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .with_context(|| format!("HTTPS listener rejected key pair {}", cert_path.display()))?;

    info!(cert = %cert_path.display(), "HTTPS listener certificate ready");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn restricted_provider(names: &[String]) -> Result<rustls::crypto::CryptoProvider> {
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    provider
        .cipher_suites
        .retain(|suite| names.iter().any(|n| format!("{:?}", suite.suite()) == *n));
    if provider.cipher_suites.is_empty() {
        anyhow::bail!("cipher_suites matched none of the supported suites");
    }
    Ok(provider)
}

fn read_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = File::open(path)
        .with_context(|| format!("cannot open certificate chain {}", path.display()))?;
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("certificate chain {} is not valid PEM", path.display()))?;
    if chain.is_empty() {
        anyhow::bail!("certificate chain {} holds no certificates", path.display());
    }
    Ok(chain)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = File::open(path)
        .with_context(|| format!("cannot open private key {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .with_context(|| format!("private key {} is not valid PEM", path.display()))?
        .with_context(|| format!("no private key material in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_log::AccessLogger;
    use crate::config::{ProxyConfig, RouteServiceConfig};
    use crate::registry::RouteRegistry;
    use crate::route::{Endpoint, RouteKey};
    use crate::route_service::{RouteServiceSigner, FORWARDED_URL_HEADER, SIGNATURE_HEADER};
    use crate::varz::Varz;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::body::Incoming;
    use hyper::header::{self, HeaderValue};
    use hyper::{Request, Response, StatusCode};
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    type TestResponse = Response<Full<Bytes>>;

    /// Spin up a loopback backend whose responses come from `make`.
    async fn spawn_backend<F>(make: F) -> (SocketAddr, Arc<AtomicUsize>)
    where
        F: Fn(&Request<Incoming>) -> TestResponse + Clone + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_outer = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let make = make.clone();
                let hits = Arc::clone(&hits_outer);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let make = make.clone();
                        let hits = Arc::clone(&hits);
                        async move {
                            hits.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, hyper::Error>(make(&req))
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (addr, hits)
    }

    /// A port that refuses connections: bind, note the port, drop.
    async fn refused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    struct TestRouter {
        addr: SocketAddr,
        registry: Arc<RouteRegistry>,
        varz: Arc<Varz>,
        _shutdown: watch::Sender<bool>,
    }

    async fn spawn_router(config: ProxyConfig, signer: Option<RouteServiceSigner>) -> TestRouter {
        let registry = Arc::new(RouteRegistry::new(Duration::from_secs(30)));
        let varz = Arc::new(Varz::new());
        let upstream = UpstreamClient::new(&config).unwrap();
        let handler = ProxyHandler::new(
            Arc::clone(&registry),
            upstream,
            signer.map(Arc::new),
            AccessLogger::disabled(),
            Arc::clone(&varz),
            Arc::new(config),
        );

        let (tx, rx) = watch::channel(false);
        let server = ProxyServer::new(handler, rx);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.run(listener));

        TestRouter {
            addr,
            registry,
            varz,
            _shutdown: tx,
        }
    }

    fn register(router: &TestRouter, key: &str, addr: SocketAddr, instance_id: &str) -> Endpoint {
        let endpoint = Endpoint::new(addr.ip().to_string(), addr.port())
            .with_instance_id(instance_id);
        router
            .registry
            .register(&RouteKey::parse(key).unwrap(), endpoint.clone());
        endpoint
    }

    async fn get(
        router_addr: SocketAddr,
        host: &str,
        path: &str,
        cookie: Option<&str>,
    ) -> Response<Incoming> {
        let client: Client<_, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build_http();
        let mut builder = Request::builder()
            .uri(format!("http://{}{}", router_addr, path))
            .header(header::HOST, host);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        let req = builder.body(Full::new(Bytes::new())).unwrap();
        client.request(req).await.unwrap()
    }

    async fn body_string(response: Response<Incoming>) -> String {
        let collected = response.into_body().collect().await.unwrap();
        String::from_utf8(collected.to_bytes().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn proxies_exact_match_to_backend() {
        let router = spawn_router(ProxyConfig::default(), None).await;
        let (backend, hits) = spawn_backend(|_req| {
            Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from_static(b"hello from backend")))
                .unwrap()
        })
        .await;
        register(&router, "foo.example.com", backend, "a1");

        let response = get(router.addr, "foo.example.com", "/", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "hello from backend");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let snap = router.varz.snapshot(0, 0);
        assert_eq!(snap.requests, 1);
    }

    #[tokio::test]
    async fn unknown_host_gets_404() {
        let router = spawn_router(ProxyConfig::default(), None).await;
        let response = get(router.addr, "nope.example.com", "/", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_string(response).await;
        assert!(body.contains("nope.example.com"));
    }

    #[tokio::test]
    async fn missing_host_gets_400() {
        let router = spawn_router(ProxyConfig::default(), None).await;

        // HTTP/1.0-style request without a Host header
        let mut stream = tokio::net::TcpStream::connect(router.addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.0\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let head = String::from_utf8_lossy(&buf);
        assert!(head.starts_with("HTTP/1."), "got: {}", head);
        assert!(head.contains(" 400 "), "got: {}", head);
    }

    #[tokio::test]
    async fn forwarding_headers_reach_backend() {
        let router = spawn_router(ProxyConfig::default(), None).await;
        let (backend, _hits) = spawn_backend(|req| {
            let xff = req
                .headers()
                .get("x-forwarded-for")
                .map(|v| v.to_str().unwrap().to_string())
                .unwrap_or_default();
            let proto = req
                .headers()
                .get("x-forwarded-proto")
                .map(|v| v.to_str().unwrap().to_string())
                .unwrap_or_default();
            let rid = req
                .headers()
                .get("x-vcap-request-id")
                .map(|v| v.to_str().unwrap().to_string())
                .unwrap_or_default();
            Response::builder()
                .header("echo-xff", xff)
                .header("echo-proto", proto)
                .header("echo-rid", rid)
                .body(Full::new(Bytes::new()))
                .unwrap()
        })
        .await;
        register(&router, "foo.example.com", backend, "a1");

        let response = get(router.addr, "foo.example.com", "/", None).await;
        assert_eq!(
            response.headers().get("echo-xff").unwrap(),
            &HeaderValue::from_static("127.0.0.1")
        );
        assert_eq!(
            response.headers().get("echo-proto").unwrap(),
            &HeaderValue::from_static("http")
        );
        // a v4 uuid was injected
        let rid = response.headers().get("echo-rid").unwrap().to_str().unwrap();
        assert_eq!(rid.len(), 36);
    }

    #[tokio::test]
    async fn connection_failure_retries_next_member() {
        let router = spawn_router(ProxyConfig::default(), None).await;
        let dead = refused_addr().await;
        let (live, live_hits) = spawn_backend(|_req| {
            Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from_static(b"served by b")))
                .unwrap()
        })
        .await;

        // dead first so the round-robin cursor tries it before the live one
        register(&router, "retry.example.com", dead, "a1");
        register(&router, "retry.example.com", live, "b1");

        let response = get(router.addr, "retry.example.com", "/", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "served by b");
        assert_eq!(live_hits.load(Ordering::SeqCst), 1);

        // the failed member is marked: the next request goes straight to b
        let response = get(router.addr, "retry.example.com", "/", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(live_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn upstream_error_response_is_relayed_without_retry() {
        let router = spawn_router(ProxyConfig::default(), None).await;
        let (failing, failing_hits) = spawn_backend(|_req| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::from_static(b"oops")))
                .unwrap()
        })
        .await;
        let (other, other_hits) = spawn_backend(|_req| {
            Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::new()))
                .unwrap()
        })
        .await;

        register(&router, "err.example.com", failing, "a1");
        register(&router, "err.example.com", other, "b1");

        let response = get(router.addr, "err.example.com", "/", None).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(response).await, "oops");
        assert_eq!(failing_hits.load(Ordering::SeqCst), 1);
        assert_eq!(other_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_members_down_yields_502() {
        let router = spawn_router(ProxyConfig::default(), None).await;
        register(&router, "down.example.com", refused_addr().await, "a1");
        register(&router, "down.example.com", refused_addr().await, "b1");

        let response = get(router.addr, "down.example.com", "/", None).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn sticky_cookie_biases_selection() {
        let router = spawn_router(ProxyConfig::default(), None).await;
        let (a, a_hits) = spawn_backend(|_req| {
            Response::builder().body(Full::new(Bytes::new())).unwrap()
        })
        .await;
        let (b, b_hits) = spawn_backend(|_req| {
            Response::builder().body(Full::new(Bytes::new())).unwrap()
        })
        .await;

        register(&router, "sticky.example.com", a, "a1");
        register(&router, "sticky.example.com", b, "b1");

        for _ in 0..4 {
            let response = get(
                router.addr,
                "sticky.example.com",
                "/",
                Some("__VCAP_ID__=b1"),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(a_hits.load(Ordering::SeqCst), 0);
        assert_eq!(b_hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn affinity_cookie_triggers_sticky_emission() {
        let router = spawn_router(ProxyConfig::default(), None).await;
        let (backend, _hits) = spawn_backend(|_req| {
            Response::builder()
                .header(header::SET_COOKIE, "JSESSIONID=xyz; Path=/")
                .body(Full::new(Bytes::new()))
                .unwrap()
        })
        .await;
        register(&router, "app.example.com", backend, "inst-9");

        let response = get(router.addr, "app.example.com", "/", None).await;
        let cookies: Vec<_> = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert!(cookies.iter().any(|c| c.starts_with("JSESSIONID=")));
        assert!(cookies
            .iter()
            .any(|c| c.starts_with("__VCAP_ID__=inst-9")));
    }

    #[tokio::test]
    async fn slow_backend_times_out_with_504() {
        let config = ProxyConfig {
            endpoint_timeout: 1,
            ..ProxyConfig::default()
        };
        let router = spawn_router(config, None).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // accept and sit on the connection without responding
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let _hold = stream;
                    tokio::time::sleep(Duration::from_secs(10)).await;
                });
            }
        });
        register(&router, "slow.example.com", addr, "a1");

        let response = get(router.addr, "slow.example.com", "/", None).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn longest_prefix_routes_to_the_right_pool() {
        let router = spawn_router(ProxyConfig::default(), None).await;
        let (a, a_hits) = spawn_backend(|_req| {
            Response::builder().body(Full::new(Bytes::new())).unwrap()
        })
        .await;
        let (b, b_hits) = spawn_backend(|_req| {
            Response::builder().body(Full::new(Bytes::new())).unwrap()
        })
        .await;

        register(&router, "split.example.com", a, "a1");
        register(&router, "split.example.com/api", b, "b1");

        let response = get(router.addr, "split.example.com", "/api/v1", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(a_hits.load(Ordering::SeqCst), 0);
        assert_eq!(b_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn route_service_divert_carries_signed_envelope() {
        let signer_config = RouteServiceConfig {
            route_service_enabled: true,
            route_service_secret: "rs-secret".to_string(),
            ..RouteServiceConfig::default()
        };
        let signer = RouteServiceSigner::from_config(&signer_config)
            .unwrap()
            .unwrap();
        let router = spawn_router(ProxyConfig::default(), Some(signer)).await;

        let (rs, rs_hits) = spawn_backend(|req| {
            let forwarded = req
                .headers()
                .get(FORWARDED_URL_HEADER)
                .map(|v| v.to_str().unwrap().to_string())
                .unwrap_or_default();
            let signature = req
                .headers()
                .get(SIGNATURE_HEADER)
                .map(|v| v.to_str().unwrap().to_string())
                .unwrap_or_default();
            let host = req
                .headers()
                .get(header::HOST)
                .map(|v| v.to_str().unwrap().to_string())
                .unwrap_or_default();
            Response::builder()
                .header("echo-forwarded-url", forwarded)
                .header("echo-signature", signature)
                .header("echo-host", host)
                .body(Full::new(Bytes::new()))
                .unwrap()
        })
        .await;

        let endpoint = Endpoint::new("10.255.0.1", 1)
            .with_route_service_url(format!("http://{}/policy", rs));
        router
            .registry
            .register(&RouteKey::parse("svc.example.com").unwrap(), endpoint);

        let response = get(router.addr, "svc.example.com", "/protected?q=1", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(rs_hits.load(Ordering::SeqCst), 1);

        let forwarded = response
            .headers()
            .get("echo-forwarded-url")
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(forwarded, "http://svc.example.com/protected?q=1");

        let echoed_host = response
            .headers()
            .get("echo-host")
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(echoed_host, rs.to_string());

        // the signature decrypts under the active key and names the same URL
        let verifier = RouteServiceSigner::from_config(&signer_config)
            .unwrap()
            .unwrap();
        let signature = response
            .headers()
            .get("echo-signature")
            .unwrap()
            .to_str()
            .unwrap();
        let envelope = verifier.verify(signature, "").unwrap();
        assert_eq!(envelope.forwarded_url, "http://svc.example.com/protected?q=1");
    }

    #[tokio::test]
    async fn signed_return_leg_reaches_backend() {
        let signer_config = RouteServiceConfig {
            route_service_enabled: true,
            route_service_secret: "rs-secret".to_string(),
            ..RouteServiceConfig::default()
        };
        let router = spawn_router(
            ProxyConfig::default(),
            Some(
                RouteServiceSigner::from_config(&signer_config)
                    .unwrap()
                    .unwrap(),
            ),
        )
        .await;

        let (backend, backend_hits) = spawn_backend(|req| {
            // the backend must not see the routing envelope
            assert!(req.headers().get(SIGNATURE_HEADER).is_none());
            Response::builder()
                .body(Full::new(Bytes::from_static(b"from backend")))
                .unwrap()
        })
        .await;

        let endpoint = Endpoint::new(backend.ip().to_string(), backend.port())
            .with_route_service_url("http://unreachable.invalid/policy");
        router
            .registry
            .register(&RouteKey::parse("svc.example.com").unwrap(), endpoint);

        // simulate the route service calling back with a valid envelope
        let signer = RouteServiceSigner::from_config(&signer_config)
            .unwrap()
            .unwrap();
        let (signature, metadata) = signer.sign("http://svc.example.com/wrapped").unwrap();

        let client: Client<_, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build_http();
        let req = Request::builder()
            .uri(format!("http://{}/wrapped", router.addr))
            .header(header::HOST, "svc.example.com")
            .header(SIGNATURE_HEADER, signature)
            .header("X-CF-Proxy-Metadata", metadata)
            .header(FORWARDED_URL_HEADER, "http://svc.example.com/wrapped")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = client.request(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "from backend");
        assert_eq!(backend_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tampered_return_leg_is_refused() {
        let signer_config = RouteServiceConfig {
            route_service_enabled: true,
            route_service_secret: "rs-secret".to_string(),
            ..RouteServiceConfig::default()
        };
        let router = spawn_router(
            ProxyConfig::default(),
            Some(
                RouteServiceSigner::from_config(&signer_config)
                    .unwrap()
                    .unwrap(),
            ),
        )
        .await;

        let (backend, backend_hits) = spawn_backend(|_req| {
            Response::builder().body(Full::new(Bytes::new())).unwrap()
        })
        .await;
        let endpoint = Endpoint::new(backend.ip().to_string(), backend.port())
            .with_route_service_url("http://unreachable.invalid/policy");
        router
            .registry
            .register(&RouteKey::parse("svc.example.com").unwrap(), endpoint);

        let client: Client<_, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build_http();
        let req = Request::builder()
            .uri(format!("http://{}/wrapped", router.addr))
            .header(header::HOST, "svc.example.com")
            .header(SIGNATURE_HEADER, "bm90LWEtcmVhbC1zaWduYXR1cmU=")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = client.request(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(backend_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upgrade_requests_are_tunneled() {
        let router = spawn_router(ProxyConfig::default(), None).await;

        // echo backend that accepts any upgrade
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let service = service_fn(|mut req: Request<Incoming>| async move {
                        let on_upgrade = hyper::upgrade::on(&mut req);
                        tokio::spawn(async move {
                            if let Ok(upgraded) = on_upgrade.await {
                                let mut io = TokioIo::new(upgraded);
                                let mut buf = [0u8; 64];
                                loop {
                                    match io.read(&mut buf).await {
                                        Ok(0) | Err(_) => break,
                                        Ok(n) => {
                                            if io.write_all(&buf[..n]).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                }
                            }
                        });
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(StatusCode::SWITCHING_PROTOCOLS)
                                .header(header::UPGRADE, "echo")
                                .header(header::CONNECTION, "upgrade")
                                .body(Full::new(Bytes::new()))
                                .unwrap(),
                        )
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await;
                });
            }
        });
        register(&router, "ws.example.com", backend, "a1");

        let mut stream = tokio::net::TcpStream::connect(router.addr).await.unwrap();
        stream
            .write_all(
                b"GET /live HTTP/1.1\r\nHost: ws.example.com\r\nConnection: upgrade\r\nUpgrade: echo\r\n\r\n",
            )
            .await
            .unwrap();

        // read the 101 response head
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8_lossy(&head);
        assert!(head.starts_with("HTTP/1.1 101"), "got: {}", head);

        // bytes round-trip through the tunnel
        stream.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");
    }
}
