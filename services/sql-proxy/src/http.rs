//! Metrics, health and version endpoints.
//!
//! - `/metrics`: Prometheus text exposition
//! - `/livez`: process is up
//! - `/healthz`: a handshake can be read through the proxy itself
//! - `/readyz`: a handshake can be read from the upstream directly
//! - `/version`: build information
//!
//! Both probes open a MySQL connection and drop it after the greeting,
//! without authenticating. The server counts each one as an aborted connect
//! against `max_connect_errors`, so frequent probes with no real traffic in
//! between can get the proxy host blocked. Probe results are therefore cached
//! for [`PROBE_CACHE_TTL`] (configurable), and repeated probes within that
//! window are answered without touching the database.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::future::Future;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use plfm_mysql_wire::InitialHandshakePacket;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::metrics::ProxyMetrics;
use crate::proxy::UpstreamDialer;

/// Upper bound on a single health probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a probe result is reused before the database is probed again.
pub const PROBE_CACHE_TTL: Duration = Duration::from_secs(5);

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    metrics: Arc<ProxyMetrics>,
    proxy_addr: SocketAddr,
    dialer: UpstreamDialer,
    probe_timeout: Duration,
    probe_cache_ttl: Duration,
    health_cache: Arc<ProbeCache>,
    ready_cache: Arc<ProbeCache>,
}

impl HttpState {
    /// `proxy_addr` is the proxy's bound address; an unspecified IP is
    /// probed over loopback.
    pub fn new(metrics: Arc<ProxyMetrics>, proxy_addr: SocketAddr, dialer: UpstreamDialer) -> Self {
        Self {
            metrics,
            proxy_addr: probe_addr(proxy_addr),
            dialer,
            probe_timeout: PROBE_TIMEOUT,
            probe_cache_ttl: PROBE_CACHE_TTL,
            health_cache: Arc::default(),
            ready_cache: Arc::default(),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Reuse probe results for `ttl`; zero probes on every request.
    pub fn with_probe_cache_ttl(mut self, ttl: Duration) -> Self {
        self.probe_cache_ttl = ttl;
        self
    }
}

type ProbeResult = Result<InitialHandshakePacket, String>;

/// Last result of one probe kind.
///
/// The lock is held across the probe, so concurrent requests share a single
/// database connection.
#[derive(Default)]
struct ProbeCache {
    last: Mutex<Option<(Instant, ProbeResult)>>,
}

impl ProbeCache {
    async fn get_or_probe<F, Fut>(&self, ttl: Duration, probe: F) -> ProbeResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProbeResult>,
    {
        let mut last = self.last.lock().await;
        if let Some((at, result)) = last.as_ref() {
            if at.elapsed() < ttl {
                return result.clone();
            }
        }

        let result = probe().await;
        *last = Some((Instant::now(), result.clone()));
        result
    }
}

/// Probe response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "ok" or "unavailable".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (RFC 3339).
    pub timestamp: String,

    /// Server version from the probed handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,

    /// Failure details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Build information.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    pub git_commit: String,
    pub build_time: String,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_commit: option_env!("GIT_COMMIT").unwrap_or("unknown").to_string(),
            build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
        }
    }
}

/// Create the HTTP router.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/livez", get(livez))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/version", get(version))
        .with_state(state)
}

/// Serve until `shutdown` turns `true` (or its sender is dropped).
pub async fn serve(
    listener: TcpListener,
    state: HttpState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("HTTP server shutting down");
        })
        .await
}

async fn metrics(State(state): State<HttpState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.render_prometheus(),
    )
}

async fn livez() -> StatusCode {
    StatusCode::OK
}

async fn healthz(State(state): State<HttpState>) -> impl IntoResponse {
    let addr = state.proxy_addr;
    let probe_timeout = state.probe_timeout;
    let result = state
        .health_cache
        .get_or_probe(state.probe_cache_ttl, || async move {
            tokio::time::timeout(probe_timeout, async move {
                let mut stream = TcpStream::connect(addr).await.map_err(|e| e.to_string())?;
                InitialHandshakePacket::read_from(&mut stream)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await
            .unwrap_or_else(|_| Err("probe timed out".to_string()))
        })
        .await;

    probe_response("healthz", result)
}

async fn readyz(State(state): State<HttpState>) -> impl IntoResponse {
    let dialer = state.dialer.clone();
    let probe_timeout = state.probe_timeout;
    let result = state
        .ready_cache
        .get_or_probe(state.probe_cache_ttl, || async move {
            tokio::time::timeout(probe_timeout, async move {
                let mut stream = dialer.dial().await.map_err(|e| e.to_string())?;
                InitialHandshakePacket::read_from(&mut stream)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await
            .unwrap_or_else(|_| Err("probe timed out".to_string()))
        })
        .await;

    probe_response("readyz", result)
}

async fn version() -> Json<VersionInfo> {
    Json(VersionInfo::current())
}

fn probe_response(
    probe: &'static str,
    result: Result<InitialHandshakePacket, String>,
) -> (StatusCode, Json<HealthResponse>) {
    let (code, status, server_version, message) = match result {
        Ok(handshake) => (
            StatusCode::OK,
            "ok",
            Some(handshake.server_version_str().into_owned()),
            None,
        ),
        Err(e) => {
            warn!(probe, error = %e, "Health probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable", None, Some(e))
        }
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            service: "sql-proxy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
            server_version,
            message,
        }),
    )
}

fn probe_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{Instrumentation, UpstreamTarget};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tower::ServiceExt;

    fn handshake_bytes() -> Vec<u8> {
        let mut payload = vec![10u8];
        payload.extend_from_slice(b"8.0.36\0");
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(b"abcdefgh");
        payload.push(0x00);
        payload.extend_from_slice(&[0x00, 0x00, 0x21, 0x02, 0x00, 0x00, 0x00, 0x00]);
        payload.extend_from_slice(&[0u8; 10]);
        payload.extend_from_slice(b"mysql_native_password\0");

        let mut packet = (payload.len() as u32).to_le_bytes()[..3].to_vec();
        packet.push(0);
        packet.extend_from_slice(&payload);
        packet
    }

    /// Server that greets every connection with `greeting`.
    async fn spawn_greeter(greeting: Vec<u8>) -> SocketAddr {
        spawn_counting_greeter(greeting, Arc::default()).await
    }

    async fn spawn_counting_greeter(greeting: Vec<u8>, accepted: Arc<AtomicUsize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                let greeting = greeting.clone();
                tokio::spawn(async move {
                    let _ = stream.write_all(&greeting).await;
                });
            }
        });
        addr
    }

    async fn closed_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn state(proxy_addr: SocketAddr, upstream: SocketAddr) -> HttpState {
        let dialer = UpstreamDialer::plain(UpstreamTarget::new(
            upstream.ip().to_string(),
            upstream.port(),
        ));
        HttpState::new(Arc::new(ProxyMetrics::new()), proxy_addr, dialer)
            .with_probe_cache_ttl(Duration::ZERO)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[test]
    fn test_probe_addr_uses_loopback_for_unspecified() {
        assert_eq!(
            probe_addr("0.0.0.0:3306".parse().unwrap()),
            "127.0.0.1:3306".parse().unwrap()
        );
        assert_eq!(
            probe_addr("[::]:3306".parse().unwrap()),
            "[::1]:3306".parse().unwrap()
        );
        assert_eq!(
            probe_addr("10.0.0.5:3306".parse().unwrap()),
            "10.0.0.5:3306".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn test_livez() {
        let addr = closed_addr().await;
        let (status, _) = get(router(state(addr, addr)), "/livez").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let addr = closed_addr().await;
        let state = state(addr, addr);
        state.metrics.on_bytes_from_client(42);

        let response = router(state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            PROMETHEUS_CONTENT_TYPE
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("proxy_data_from_client_bytes_total 42"));
    }

    #[tokio::test]
    async fn test_healthz_and_readyz_ok() {
        let server = spawn_greeter(handshake_bytes()).await;

        let (status, body) = get(router(state(server, server)), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.server_version.as_deref(), Some("8.0.36"));

        let (status, _) = get(router(state(server, server)), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_probes_fail_when_unreachable() {
        let addr = closed_addr().await;

        let (status, body) = get(router(state(addr, addr)), "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "unavailable");
        assert!(health.message.is_some());

        let (status, _) = get(router(state(addr, addr)), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_probe_rejects_non_handshake() {
        let server = spawn_greeter(vec![0x01, 0x00, 0x00, 0x00, 0xff]).await;
        let (status, body) = get(router(state(server, server)), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert!(health.message.unwrap().contains("unsupported protocol"));
    }

    #[tokio::test]
    async fn test_probe_times_out() {
        // Accepts but never greets.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let state = state(addr, addr).with_probe_timeout(Duration::from_millis(50));
        let (status, body) = get(router(state), "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.message.as_deref(), Some("probe timed out"));
    }

    #[tokio::test]
    async fn test_repeated_probes_reuse_cached_result() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let server = spawn_counting_greeter(handshake_bytes(), accepted.clone()).await;
        let app = router(state(server, server).with_probe_cache_ttl(Duration::from_secs(60)));

        for _ in 0..3 {
            let (status, _) = get(app.clone(), "/readyz").await;
            assert_eq!(status, StatusCode::OK);
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        // Separate cache per probe.
        let (status, _) = get(app.clone(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_probes_every_request() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let server = spawn_counting_greeter(handshake_bytes(), accepted.clone()).await;
        let app = router(state(server, server));

        for _ in 0..3 {
            let (status, _) = get(app.clone(), "/readyz").await;
            assert_eq!(status, StatusCode::OK);
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_version() {
        let addr = closed_addr().await;
        let (status, body) = get(router(state(addr, addr)), "/version").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert!(json.get("gitCommit").is_some());
        assert!(json.get("buildTime").is_some());
    }
}
