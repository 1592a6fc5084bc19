//! plfm-vt SQL Proxy
//!
//! Transparent MySQL proxy with handshake inspection.
//!
//! This service:
//! - Accepts MySQL clients on the bind address
//! - Dials the configured upstream server (optionally over TLS)
//! - Decodes and re-emits the server handshake when decoding is enabled
//! - Relays traffic both ways and exports Prometheus metrics
//! - Serves health, readiness and version endpoints

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plfm_sql_proxy::http::{self, HttpState};
use plfm_sql_proxy::signal::ShutdownSignals;
use plfm_sql_proxy::{Config, Proxy, ProxyMetrics, ShutdownPolicy};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to LOG_LEVEL / DEBUG)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting plfm-vt sql-proxy");
    if config.debug {
        debug!(config = ?config, "Configuration loaded");
    } else {
        info!(
            bind_addr = %config.bind_addr(),
            upstream_host = %config.upstream_host,
            upstream_port = config.upstream_port,
            use_ssl = config.use_ssl,
            metrics_port = config.metrics_port,
            "Configuration loaded"
        );
    }

    let mut signals = ShutdownSignals::install().context("failed to install signal handlers")?;

    let metrics = Arc::new(ProxyMetrics::new());

    let proxy = Proxy::bind(config.proxy_config(), metrics.clone())
        .await
        .context("failed to start proxy")?;

    let metrics_addr = config.metrics_addr();
    let http_listener = TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics server on {metrics_addr}"))?;
    info!(addr = %metrics_addr, "Metrics server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_state = HttpState::new(metrics.clone(), proxy.local_addr(), proxy.dialer().clone())
        .with_probe_cache_ttl(config.probe_cache_ttl);
    let http_handle = tokio::spawn(http::serve(http_listener, http_state, shutdown_rx.clone()));

    tokio::spawn(async move {
        let signal = signals.recv().await;
        info!(signal, "Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let in_flight = proxy.in_flight();
    proxy.run(shutdown_rx).await.context("proxy failed")?;

    if config.shutdown_policy == ShutdownPolicy::Drain {
        info!(
            in_flight = in_flight.count(),
            timeout_secs = config.drain_timeout.as_secs(),
            "Draining connections"
        );
        match tokio::time::timeout(config.drain_timeout, in_flight.wait_idle()).await {
            Ok(()) => info!("All connections drained"),
            Err(_) => warn!(
                in_flight = in_flight.count(),
                "Drain timeout reached, dropping remaining connections"
            ),
        }
    }

    match http_handle.await {
        Ok(Ok(())) => info!("Metrics server exited normally"),
        Ok(Err(e)) => error!(error = %e, "Metrics server error"),
        Err(e) => error!(error = %e, "Metrics server task panicked"),
    }

    info!("sql-proxy shutdown complete");
    Ok(())
}
