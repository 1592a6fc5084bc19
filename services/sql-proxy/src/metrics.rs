//! Proxy metrics registry and Prometheus text exposition.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use crate::proxy::Instrumentation;

/// Counters and gauges for one proxy instance.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    connections_total: AtomicU64,
    connections_open: AtomicI64,
    errors_total: AtomicU64,
    connections_rejected: AtomicU64,
    bytes_from_client: AtomicU64,
    bytes_to_client: AtomicU64,
    /// f64 seconds, stored as raw bits.
    last_request_latency: AtomicU64,
}

/// Point-in-time copy of [`ProxyMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_open: i64,
    pub errors_total: u64,
    pub connections_rejected: u64,
    pub bytes_from_client: u64,
    pub bytes_to_client: u64,
    pub last_request_latency_seconds: f64,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_open: self.connections_open.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            bytes_from_client: self.bytes_from_client.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            last_request_latency_seconds: f64::from_bits(
                self.last_request_latency.load(Ordering::Relaxed),
            ),
        }
    }

    /// Render all metrics in the Prometheus text exposition format (0.0.4).
    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        out.push_str("# HELP proxy_connections_total Total number of connections to the proxy.\n");
        out.push_str("# TYPE proxy_connections_total counter\n");
        out.push_str(&format!("proxy_connections_total {}\n", s.connections_total));

        out.push_str("# HELP proxy_connections_open Number of open connections to the proxy.\n");
        out.push_str("# TYPE proxy_connections_open gauge\n");
        out.push_str(&format!("proxy_connections_open {}\n", s.connections_open));

        out.push_str(
            "# HELP proxy_errors_total Total number of errors encountered by the proxy.\n",
        );
        out.push_str("# TYPE proxy_errors_total counter\n");
        out.push_str(&format!("proxy_errors_total {}\n", s.errors_total));

        out.push_str(
            "# HELP proxy_connections_rejected_total Connections refused at admission.\n",
        );
        out.push_str("# TYPE proxy_connections_rejected_total counter\n");
        out.push_str(&format!(
            "proxy_connections_rejected_total {}\n",
            s.connections_rejected
        ));

        out.push_str("# HELP proxy_data_from_client_bytes_total Total number of bytes transferred from client to server through the proxy.\n");
        out.push_str("# TYPE proxy_data_from_client_bytes_total counter\n");
        out.push_str(&format!(
            "proxy_data_from_client_bytes_total {}\n",
            s.bytes_from_client
        ));

        out.push_str("# HELP proxy_data_to_client_bytes_total Total number of bytes transferred from server to client through the proxy.\n");
        out.push_str("# TYPE proxy_data_to_client_bytes_total counter\n");
        out.push_str(&format!(
            "proxy_data_to_client_bytes_total {}\n",
            s.bytes_to_client
        ));

        out.push_str("# HELP proxy_last_request_latency_seconds The latency of the last proxy request in seconds.\n");
        out.push_str("# TYPE proxy_last_request_latency_seconds gauge\n");
        out.push_str(&format!(
            "proxy_last_request_latency_seconds {}\n",
            s.last_request_latency_seconds
        ));

        out
    }
}

impl Instrumentation for ProxyMetrics {
    fn on_connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_open.fetch_add(1, Ordering::Relaxed);
    }

    fn on_connection_closed(&self) {
        self.connections_open.fetch_sub(1, Ordering::Relaxed);
    }

    fn on_connection_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    fn on_connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn on_bytes_from_client(&self, n: u64) {
        self.bytes_from_client.fetch_add(n, Ordering::Relaxed);
    }

    fn on_bytes_to_client(&self, n: u64) {
        self.bytes_to_client.fetch_add(n, Ordering::Relaxed);
    }

    fn on_last_request_latency(&self, latency: Duration) {
        self.last_request_latency
            .store(latency.as_secs_f64().to_bits(), Ordering::Relaxed);
    }
}
