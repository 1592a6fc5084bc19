//! Transparent MySQL proxy core.
//!
//! This module provides:
//! - The accept loop with admission control and graceful shutdown
//! - Upstream dialing over plain TCP or TLS
//! - Optional inspection of the server's initial handshake
//! - Instrumented bidirectional relaying
//!
//! ## Architecture
//!
//! ```text
//! Client -> Proxy (accept, admit) -> ConnectionHandler -> UpstreamDialer -> Server
//!                                          |
//!                           handshake decode/re-encode (optional)
//!                                          |
//!                                  relay (both directions)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let config = ProxyConfig::new("0.0.0.0:3306".parse()?, UpstreamTarget::new("db", 3306));
//! let proxy = Proxy::bind(config, Arc::new(ProxyMetrics::new())).await?;
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let in_flight = proxy.in_flight();
//! proxy.run(shutdown_rx).await?;
//! in_flight.wait_idle().await;
//! ```

mod connection;
mod dialer;
mod in_flight;
mod instrumentation;
mod listener;
mod relay;
mod tls;

pub use connection::{Connection, ConnectionError, ConnectionHandler};
pub use dialer::{DialError, UpstreamDialer, UpstreamStream, UpstreamTarget};
pub use in_flight::{InFlight, InFlightGuard};
pub use instrumentation::Instrumentation;
pub use listener::{
    Proxy, ProxyConfig, ProxyState, ShutdownPolicy, StartError, ACCEPT_ERROR_BACKOFF,
};
pub use relay::{relay, DirectionStats, RelayStats, RELAY_BUFFER_SIZE};
pub use tls::{build_client_config, load_certificates, load_private_key, TlsError, TlsOptions};
