//! # plfm-sql-proxy
//!
//! Transparent MySQL proxy. Clients connect to the proxy, the proxy dials the
//! real server (optionally over TLS), optionally decodes and re-emits the
//! server's initial handshake, and then relays bytes both ways while
//! recording connection, traffic and latency metrics.
//!
//! The binary wires this library to environment configuration, a Prometheus
//! and health HTTP endpoint, and signal-driven shutdown.

pub mod config;
pub mod http;
pub mod metrics;
pub mod proxy;
pub mod signal;

pub use config::Config;
pub use metrics::{MetricsSnapshot, ProxyMetrics};
pub use proxy::{
    Connection, ConnectionError, ConnectionHandler, DialError, InFlight, Instrumentation,
    Proxy, ProxyConfig, ProxyState, ShutdownPolicy, StartError, TlsError, TlsOptions,
    UpstreamDialer, UpstreamStream, UpstreamTarget,
};
