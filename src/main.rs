use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gantry::access_log::AccessLogger;
use gantry::config::Config;
use gantry::fetcher::RouteFetcher;
use gantry::ingest::{NatsBus, SubscriptionIngest};
use gantry::proxy::{tls_acceptor, ProxyHandler, ProxyServer, UpstreamClient};
use gantry::registry::RouteRegistry;
use gantry::route_service::RouteServiceSigner;
use gantry::status::{self, StatusState};
use gantry::varz::Varz;

#[derive(Parser, Debug)]
#[command(name = "gantry")]
#[command(author, version, about = "Dynamic reverse-proxy router for multi-tenant platforms", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "gantry.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting gantry v{}", env!("CARGO_PKG_VERSION"));

    // Dependencies pull in more than one rustls crypto provider; pin the
    // process default so bare config builders resolve deterministically.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let prometheus = status::init_prometheus();
    let varz = Arc::new(Varz::new());
    let registry = Arc::new(RouteRegistry::new(config.registry.failed_endpoint_backoff()));

    // Startup fatals: unusable secrets, unopenable sinks, unbound ports.
    let signer = RouteServiceSigner::from_config(&config.route_service)
        .context("Failed to initialize route service crypto")?
        .map(Arc::new);
    if signer.is_some() {
        tracing::info!("Route service support enabled");
    }

    let (access_log, access_log_task) = AccessLogger::spawn(&config.access_log).await?;

    let upstream = UpstreamClient::new(&config.proxy)?;
    let handler = ProxyHandler::new(
        Arc::clone(&registry),
        upstream,
        signer,
        access_log.clone(),
        Arc::clone(&varz),
        Arc::new(config.proxy.clone()),
    );

    // Two shutdown phases: listeners stop accepting first, background tasks
    // stop once in-flight requests drain.
    let (listener_tx, listener_rx) = watch::channel(false);
    let (background_tx, background_rx) = watch::channel(false);

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid proxy address")?;
    let proxy_listener = TcpListener::bind(proxy_addr)
        .await
        .with_context(|| format!("Failed to bind proxy listener on {}", proxy_addr))?;
    let proxy_server = ProxyServer::new(handler.clone(), listener_rx.clone());
    let mut inflight = vec![proxy_server.inflight()];
    tokio::spawn(proxy_server.run(proxy_listener));

    if config.tls.enabled {
        let cert = config.tls.cert_path.as_ref().expect("validated");
        let key = config.tls.key_path.as_ref().expect("validated");
        let acceptor = tls_acceptor(cert, key, &config.tls.cipher_suites)?;

        let https_addr: SocketAddr = format!("{}:{}", config.server.host, config.tls.port)
            .parse()
            .context("Invalid HTTPS proxy address")?;
        let https_listener = TcpListener::bind(https_addr)
            .await
            .with_context(|| format!("Failed to bind HTTPS listener on {}", https_addr))?;
        let https_server =
            ProxyServer::new(handler.clone(), listener_rx.clone()).with_tls(acceptor);
        inflight.push(https_server.inflight());
        tokio::spawn(https_server.run(https_listener));
    }

    let _pruner = registry.start_pruner(config.registry.pruning_interval(), background_rx.clone());

    if !config.nats.nats_servers.is_empty() {
        let bus = Arc::new(NatsBus::connect(&config.nats.nats_servers).await?);
        let ingest = SubscriptionIngest::new(
            Arc::clone(&registry),
            config.registry.stale_threshold_default(),
        );
        ingest.start(bus, config.nats.start_interval(), background_rx.clone());
    }

    if config.routing_api.enabled() {
        tracing::info!("Setting up route fetcher");
        let fetcher = RouteFetcher::new(&config.routing_api, &config.oauth, Arc::clone(&registry))?;
        if let Err(e) = fetcher.fetch_once().await {
            tracing::warn!(error = %e, "Initial route fetch failed; continuing with polling");
        }
        tokio::spawn(fetcher.run(background_rx.clone()));
    }

    let status_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.status_port)
        .parse()
        .context("Invalid status address")?;
    let status_listener = TcpListener::bind(status_addr)
        .await
        .with_context(|| format!("Failed to bind status listener on {}", status_addr))?;
    let status_state = Arc::new(StatusState {
        registry: Arc::clone(&registry),
        varz: Arc::clone(&varz),
        prometheus: Some(prometheus),
    });
    tokio::spawn(status::serve(
        status_listener,
        status_state,
        background_rx.clone(),
    ));

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, draining");

    // Stop accepting, give in-flight requests their budget, then stop the
    // ingest/pruning tasks and flush the access log.
    let _ = listener_tx.send(true);
    let drain_timeout = config.proxy.drain_timeout();
    for counter in &inflight {
        if !counter.drain(drain_timeout).await {
            tracing::warn!(
                remaining = counter.count(),
                "Drain timeout expired, force-closing connections"
            );
            break;
        }
    }
    let _ = background_tx.send(true);

    access_log.stop();
    if let Some(task) = access_log_task {
        let _ = task.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
