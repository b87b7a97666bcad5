// Upstream dispatch: the pooled transport requests travel over, the
// retryable-body machinery, and the byte relay for upgraded connections.

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Body, Incoming};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::ProxyConfig;

/// Body type flowing to upstreams and back to clients.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|e| match e {}).boxed()
}

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|e| match e {}).boxed()
}

/// The inbound request body, shaped for the retry loop. Bodiless and
/// buffered bodies can be re-sent; a streaming body is handed out once.
pub enum OutboundBody {
    Empty,
    Buffered(Bytes),
    Streaming(Option<ProxyBody>),
}

impl OutboundBody {
    /// Classify an inbound body. Bodies with a known size under `limit`
    /// are buffered so a failed dial can be retried against another pool
    /// member; anything larger streams straight through.
    pub async fn prepare(body: Incoming, limit: usize) -> Result<Self, hyper::Error> {
        let hint = body.size_hint();
        if hint.exact() == Some(0) {
            return Ok(OutboundBody::Empty);
        }
        if let Some(len) = hint.exact() {
            if len <= limit as u64 {
                let collected = body.collect().await?;
                return Ok(OutboundBody::Buffered(collected.to_bytes()));
            }
        }
        Ok(OutboundBody::Streaming(Some(body.boxed())))
    }

    pub fn is_replayable(&self) -> bool {
        !matches!(self, OutboundBody::Streaming(_))
    }

    /// Hand out a body for one attempt. Returns None when a streaming body
    /// has already been consumed.
    pub fn take(&mut self) -> Option<ProxyBody> {
        match self {
            OutboundBody::Empty => Some(empty_body()),
            OutboundBody::Buffered(bytes) => Some(full_body(bytes.clone())),
            OutboundBody::Streaming(inner) => inner.take(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Dial failure or connection torn down before any response bytes.
    /// Eligible for retry against another pool member.
    #[error("connection-level failure: {0}")]
    Connect(String),
    /// The endpoint timeout elapsed with no response.
    #[error("upstream round-trip timed out")]
    Timeout,
    /// Anything else; terminal for the request.
    #[error("upstream request failed: {0}")]
    Other(String),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Connect(_))
    }
}

fn classify(err: hyper_util::client::legacy::Error) -> DispatchError {
    if err.is_connect() {
        return DispatchError::Connect(err.to_string());
    }
    // Walk the chain looking for a socket-level reset that happened before
    // a response arrived.
    let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            if matches!(
                io.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::NotConnected
            ) {
                return DispatchError::Connect(err.to_string());
            }
        }
        source = cause.source();
    }
    DispatchError::Other(err.to_string())
}

/// Build the connector for upstream legs. TLS shows up on route services
/// and HTTPS backends; plain backends ride the same pooled client. The
/// crypto provider is pinned explicitly so the choice does not depend on
/// which provider features other dependencies switch on.
fn build_connector(
    http: HttpConnector,
    skip_validation: bool,
) -> anyhow::Result<hyper_rustls::HttpsConnector<HttpConnector>> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    if skip_validation {
        let tls = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow::anyhow!("TLS protocol setup failed: {}", e))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
        return Ok(hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http));
    }
    Ok(hyper_rustls::HttpsConnectorBuilder::new()
        .with_provider_and_native_roots((*provider).clone())
        .map_err(|e| anyhow::anyhow!("no usable root CA certificates: {}", e))?
        .https_or_http()
        .enable_http1()
        .wrap_connector(http))
}

/// Accept-anything verifier, only reachable through `ssl_skip_validation`.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Pooled transport shared by every request worker. Idle connections are
/// capped per backend so one hot pool cannot starve the rest.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>, ProxyBody>,
    endpoint_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &ProxyConfig) -> anyhow::Result<Self> {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_nodelay(true);
        http.enforce_http(false);

        let connector = build_connector(http, config.ssl_skip_validation)?;

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(config.pool_idle_per_host)
            .build(connector);

        Ok(Self {
            client,
            endpoint_timeout: config.endpoint_timeout(),
        })
    }

    /// One upstream round trip under the endpoint timeout.
    pub async fn send(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, DispatchError> {
        match tokio::time::timeout(self.endpoint_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(classify(err)),
            Err(_) => Err(DispatchError::Timeout),
        }
    }

    /// Round trip with no deadline, for upgrade handshakes whose tunnel
    /// outlives any request budget.
    pub async fn send_without_timeout(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, DispatchError> {
        self.client.request(req).await.map_err(classify)
    }
}

/// Splice the two upgraded connections together until one side closes.
pub fn spawn_tunnel(client_side: OnUpgrade, upstream_side: OnUpgrade) {
    tokio::spawn(async move {
        let (client_io, upstream_io) = match tokio::try_join!(client_side, upstream_side) {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "Upgrade handshake did not complete");
                return;
            }
        };
        let mut client = TokioIo::new(client_io);
        let mut upstream = TokioIo::new(upstream_io);
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((from_client, from_upstream)) => {
                debug!(from_client, from_upstream, "Tunnel closed");
            }
            Err(e) => {
                warn!(error = %e, "Tunnel terminated with error");
            }
        }
    });
}
