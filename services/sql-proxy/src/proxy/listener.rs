//! Proxy engine: listening socket, accept loop, admission and shutdown.
//!
//! ```text
//! Created --bind--> Listening --signal--> ShuttingDown --listener dropped--> Stopped
//! ```
//!
//! Every accepted socket gets the next connection id, passes the admission
//! point, and is handed to its own task. The shutdown signal only reaches
//! the accept loop; what happens to in-flight connections is governed by
//! [`ShutdownPolicy`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use super::connection::{Connection, ConnectionHandler};
use super::dialer::{UpstreamDialer, UpstreamTarget};
use super::in_flight::InFlight;
use super::instrumentation::Instrumentation;
use super::tls::{TlsError, TlsOptions};

/// Pause after a failed `accept` before trying again.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// What happens to in-flight connections when the proxy stops accepting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Leave them running until their sockets close.
    #[default]
    Drain,
    /// Abort them before `run` returns.
    Abort,
}

impl FromStr for ShutdownPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drain" => Ok(ShutdownPolicy::Drain),
            "abort" => Ok(ShutdownPolicy::Abort),
            other => Err(format!(
                "unknown shutdown policy '{other}': expected 'drain' or 'abort'"
            )),
        }
    }
}

impl fmt::Display for ShutdownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownPolicy::Drain => f.write_str("drain"),
            ShutdownPolicy::Abort => f.write_str("abort"),
        }
    }
}

/// Configuration for the proxy engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Address to accept clients on.
    pub bind_addr: SocketAddr,
    /// Real database server.
    pub upstream: UpstreamTarget,
    /// TLS to the upstream; plain TCP when `None`.
    pub tls: Option<TlsOptions>,
    /// Decode and re-encode the server handshake before relaying.
    pub decode_handshake: bool,
    /// Concurrent connection limit; 0 means unlimited.
    pub max_connections: usize,
    pub shutdown_policy: ShutdownPolicy,
}

impl ProxyConfig {
    pub fn new(bind_addr: SocketAddr, upstream: UpstreamTarget) -> Self {
        Self {
            bind_addr,
            upstream,
            tls: None,
            decode_handshake: true,
            max_connections: 0,
            shutdown_policy: ShutdownPolicy::default(),
        }
    }
}

/// Lifecycle of a [`Proxy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Created,
    Listening,
    ShuttingDown,
    Stopped,
}

/// Fatal errors while starting the proxy.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to set up upstream TLS: {0}")]
    Tls(#[from] TlsError),
}

enum Admission {
    Admitted(Option<OwnedSemaphorePermit>),
    Rejected,
}

/// The proxy engine.
pub struct Proxy {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: ConnectionHandler,
    instrumentation: Arc<dyn Instrumentation>,
    limiter: Option<Arc<Semaphore>>,
    shutdown_policy: ShutdownPolicy,
    in_flight: InFlight,
    /// Last id handed out; only the accept loop touches it.
    next_connection_id: u64,
    state: watch::Sender<ProxyState>,
}

impl Proxy {
    /// Build the dialer (loading TLS material) and bind the listener.
    pub async fn bind(
        config: ProxyConfig,
        instrumentation: Arc<dyn Instrumentation>,
    ) -> Result<Self, StartError> {
        let (state, _) = watch::channel(ProxyState::Created);

        if config.tls.as_ref().is_some_and(|tls| tls.skip_verify) {
            warn!(
                upstream = %config.upstream,
                "Upstream TLS certificate verification is disabled"
            );
        }
        let dialer = UpstreamDialer::new(config.upstream.clone(), config.tls.as_ref())?;

        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| StartError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StartError::Bind {
                addr: config.bind_addr,
                source,
            })?;

        info!(
            bind_addr = %local_addr,
            upstream = %config.upstream,
            tls = dialer.is_tls(),
            decode_handshake = config.decode_handshake,
            max_connections = config.max_connections,
            shutdown_policy = %config.shutdown_policy,
            "Proxy listening"
        );

        let limiter =
            (config.max_connections > 0).then(|| Arc::new(Semaphore::new(config.max_connections)));
        state.send_replace(ProxyState::Listening);

        Ok(Self {
            listener,
            local_addr,
            handler: ConnectionHandler::new(
                dialer,
                Arc::clone(&instrumentation),
                config.decode_handshake,
            ),
            instrumentation,
            limiter,
            shutdown_policy: config.shutdown_policy,
            in_flight: InFlight::new(),
            next_connection_id: 0,
            state,
        })
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Dialer used for upstream connections (shared with readiness probes).
    pub fn dialer(&self) -> &UpstreamDialer {
        self.handler.dialer()
    }

    /// Connection tasks spawned by this engine that have not finished yet.
    ///
    /// Under [`ShutdownPolicy::Drain`] the tasks outlive [`Proxy::run`]; wait
    /// on this handle to let them complete.
    pub fn in_flight(&self) -> InFlight {
        self.in_flight.clone()
    }

    /// Watch the engine's lifecycle state.
    pub fn subscribe_state(&self) -> watch::Receiver<ProxyState> {
        self.state.subscribe()
    }

    /// Accept connections until `shutdown` turns `true` or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let mut tasks = JoinSet::new();

        if !*shutdown.borrow_and_update() {
            loop {
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow_and_update() {
                            break;
                        }
                    }

                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(e) = joined {
                            if e.is_panic() {
                                error!(error = %e, "Connection task panicked");
                            }
                        }
                    }

                    accepted = self.listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => self.dispatch(&mut tasks, stream, peer_addr),
                            Err(e) => {
                                error!(error = %e, "Accept error");
                                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                            }
                        }
                    }
                }
            }
        }

        self.state.send_replace(ProxyState::ShuttingDown);
        info!(
            bind_addr = %self.local_addr,
            in_flight = self.in_flight.count(),
            shutdown_policy = %self.shutdown_policy,
            "Proxy shutting down"
        );
        drop(self.listener);

        match self.shutdown_policy {
            ShutdownPolicy::Drain => tasks.detach_all(),
            ShutdownPolicy::Abort => tasks.shutdown().await,
        }

        self.state.send_replace(ProxyState::Stopped);
        info!("Proxy stopped");
        Ok(())
    }

    fn dispatch(&mut self, tasks: &mut JoinSet<()>, stream: TcpStream, peer_addr: SocketAddr) {
        self.next_connection_id += 1;
        let connection_id = self.next_connection_id;

        let permit = match self.admit(connection_id, peer_addr) {
            Admission::Admitted(permit) => permit,
            Admission::Rejected => return,
        };

        debug!(connection_id, peer_addr = %peer_addr, "Connection accepted");

        let in_flight = self.in_flight.enter();
        let handler = self.handler.clone();
        let connection = Connection::new(connection_id, peer_addr, stream);
        tasks.spawn(
            async move {
                if let Err(e) = handler.handle(connection).await {
                    warn!(error = %e, reason = e.reason_code(), "Connection failed");
                }
                drop(permit);
                drop(in_flight);
            }
            .instrument(tracing::info_span!(
                "connection",
                connection_id,
                peer = %peer_addr
            )),
        );
    }

    /// Single admission point for accepted sockets.
    fn admit(&self, connection_id: u64, peer_addr: SocketAddr) -> Admission {
        let Some(limiter) = &self.limiter else {
            return Admission::Admitted(None);
        };

        match Arc::clone(limiter).try_acquire_owned() {
            Ok(permit) => Admission::Admitted(Some(permit)),
            Err(_) => {
                self.instrumentation.on_connection_rejected();
                warn!(
                    connection_id,
                    peer_addr = %peer_addr,
                    "Connection rejected: max connections reached"
                );
                Admission::Rejected
            }
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("local_addr", &self.local_addr)
            .field("dialer", self.handler.dialer())
            .field("shutdown_policy", &self.shutdown_policy)
            .field("in_flight", &self.in_flight.count())
            .field("next_connection_id", &self.next_connection_id)
            .finish()
    }
}
