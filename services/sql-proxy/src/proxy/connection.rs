//! Per-connection lifecycle: dial, optional handshake inspection, relay.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use plfm_mysql_wire::{InitialHandshakePacket, WireError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::dialer::{DialError, UpstreamDialer};
use super::instrumentation::Instrumentation;
use super::relay::{relay, RelayStats};

/// Errors that end a single connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("upstream dial failed: {0}")]
    Dial(#[from] DialError),

    #[error("failed to decode upstream handshake: {0}")]
    Decode(#[source] WireError),

    #[error("failed to encode handshake: {0}")]
    Encode(#[source] WireError),

    #[error("failed to write handshake to client: {0}")]
    ClientWrite(#[source] io::Error),
}

impl ConnectionError {
    /// Stable snake_case label for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ConnectionError::Dial(_) => "dial_failed",
            ConnectionError::Decode(_) => "handshake_decode_failed",
            ConnectionError::Encode(_) => "handshake_encode_failed",
            ConnectionError::ClientWrite(_) => "client_write_failed",
        }
    }
}

/// An accepted client connection.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    /// Engine-scoped id, starting at 1.
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub stream: S,
}

impl<S> Connection<S> {
    pub fn new(id: u64, peer_addr: SocketAddr, stream: S) -> Self {
        Self {
            id,
            peer_addr,
            stream,
        }
    }
}

/// Calls `on_connection_closed` when dropped.
struct OpenConnectionGuard<'a>(&'a dyn Instrumentation);

impl Drop for OpenConnectionGuard<'_> {
    fn drop(&mut self) {
        self.0.on_connection_closed();
    }
}

/// Drives one client connection to completion.
#[derive(Clone)]
pub struct ConnectionHandler {
    dialer: UpstreamDialer,
    instrumentation: Arc<dyn Instrumentation>,
    decode_handshake: bool,
}

impl ConnectionHandler {
    pub fn new(
        dialer: UpstreamDialer,
        instrumentation: Arc<dyn Instrumentation>,
        decode_handshake: bool,
    ) -> Self {
        Self {
            dialer,
            instrumentation,
            decode_handshake,
        }
    }

    pub fn dialer(&self) -> &UpstreamDialer {
        &self.dialer
    }

    /// Dial upstream, optionally mirror the server handshake, then relay.
    ///
    /// Both sockets are closed when this returns, whatever the outcome.
    pub async fn handle<S>(&self, connection: Connection<S>) -> Result<RelayStats, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Connection {
            id,
            peer_addr,
            stream: mut client,
        } = connection;
        let instrumentation = &*self.instrumentation;

        let mut upstream = match self.dialer.dial().await {
            Ok(upstream) => upstream,
            Err(e) => {
                instrumentation.on_connection_error();
                return Err(e.into());
            }
        };

        instrumentation.on_connection_opened();
        let _open = OpenConnectionGuard(instrumentation);

        debug!(
            connection_id = id,
            peer_addr = %peer_addr,
            upstream = %self.dialer.target(),
            tls = upstream.is_tls(),
            "Upstream connected"
        );

        if self.decode_handshake {
            if let Err(e) = mirror_handshake(&mut upstream, &mut client).await {
                instrumentation.on_connection_error();
                return Err(e);
            }
        }

        let stats = relay(client, upstream, instrumentation).await;

        debug!(
            connection_id = id,
            bytes_from_client = stats.client_to_upstream.bytes,
            bytes_to_client = stats.upstream_to_client.bytes,
            latency_ms = stats.latency().as_millis() as u64,
            "Connection closed"
        );

        Ok(stats)
    }
}

/// Decode the server's first packet and re-emit it to the client.
async fn mirror_handshake<U, C>(upstream: &mut U, client: &mut C) -> Result<(), ConnectionError>
where
    U: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let handshake = InitialHandshakePacket::read_from(upstream)
        .await
        .map_err(ConnectionError::Decode)?;

    debug!(
        server_version = %handshake.server_version_str(),
        upstream_thread_id = handshake.connection_id,
        capabilities = %handshake.capability_flags,
        auth_plugin = %handshake.auth_plugin_name_str(),
        "Upstream handshake"
    );

    let bytes = handshake.encode().map_err(ConnectionError::Encode)?;
    client
        .write_all(&bytes)
        .await
        .map_err(ConnectionError::ClientWrite)?;
    client.flush().await.map_err(ConnectionError::ClientWrite)?;
    Ok(())
}
