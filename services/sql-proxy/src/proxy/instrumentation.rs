//! Callbacks the proxy core reports into.

use std::time::Duration;

/// Observer for connection lifecycle and traffic.
///
/// Implementations are shared across every connection task and must be
/// safe to call concurrently.
pub trait Instrumentation: Send + Sync {
    /// An upstream connection was established for a client.
    fn on_connection_opened(&self);

    /// A connection that was opened has finished.
    fn on_connection_closed(&self);

    /// A connection failed (dial, handshake decode/encode, client write).
    fn on_connection_error(&self);

    /// A client was turned away at admission.
    fn on_connection_rejected(&self) {}

    /// `n` bytes were delivered from the client to the upstream.
    fn on_bytes_from_client(&self, n: u64);

    /// `n` bytes were delivered from the upstream to the client.
    fn on_bytes_to_client(&self, n: u64);

    /// The slower relay direction of a finished connection took `latency`.
    fn on_last_request_latency(&self, latency: Duration);
}
