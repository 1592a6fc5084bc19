//! Bidirectional byte relay between a client and its upstream.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

use super::instrumentation::Instrumentation;

/// Read buffer size for each direction.
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// Outcome of one relay direction.
#[derive(Debug, Default)]
pub struct DirectionStats {
    /// Bytes fully written to the destination.
    pub bytes: u64,
    /// Wall-clock time from start until the direction finished.
    pub duration: Duration,
    /// Error that ended the direction early, if any.
    pub error: Option<io::Error>,
}

/// Outcome of a finished relay.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub client_to_upstream: DirectionStats,
    pub upstream_to_client: DirectionStats,
}

impl RelayStats {
    /// Duration of the slower direction.
    pub fn latency(&self) -> Duration {
        self.client_to_upstream
            .duration
            .max(self.upstream_to_client.duration)
    }
}

/// Relay bytes both ways until both directions have finished.
///
/// Each direction half-closes its destination when its source reaches EOF.
/// One direction finishing (or failing) never cancels the other. Errors are
/// recorded in the returned stats, not propagated.
pub async fn relay<C, U>(client: C, upstream: U, instrumentation: &dyn Instrumentation) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = copy_direction(&mut client_read, &mut upstream_write, |n| {
        instrumentation.on_bytes_from_client(n)
    });
    let upstream_to_client = copy_direction(&mut upstream_read, &mut client_write, |n| {
        instrumentation.on_bytes_to_client(n)
    });

    let (client_to_upstream, upstream_to_client) =
        tokio::join!(client_to_upstream, upstream_to_client);

    if let Some(e) = &client_to_upstream.error {
        debug!(direction = "client_to_upstream", error = %e, "Relay direction failed");
    }
    if let Some(e) = &upstream_to_client.error {
        debug!(direction = "upstream_to_client", error = %e, "Relay direction failed");
    }

    let stats = RelayStats {
        client_to_upstream,
        upstream_to_client,
    };
    instrumentation.on_last_request_latency(stats.latency());
    stats
}

async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    mut on_delivered: impl FnMut(u64),
) -> DirectionStats
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let started = Instant::now();
    let mut bytes = 0u64;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    let result: io::Result<()> = async {
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            writer.write_all(&buf[..n]).await?;
            bytes += n as u64;
            on_delivered(n as u64);
        }
    }
    .await;

    // Propagate EOF (or our failure) so the peer stops waiting on us.
    let shutdown = writer.shutdown().await;

    DirectionStats {
        bytes,
        duration: started.elapsed(),
        error: result.err().or(shutdown.err()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ProxyMetrics;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_counts_bytes_each_way() {
        let (mut client_app, client_side) = duplex(64);
        let (upstream_side, mut upstream_app) = duplex(64);
        let metrics = ProxyMetrics::new();

        let upstream = tokio::spawn(async move {
            let mut request = Vec::new();
            upstream_app.read_to_end(&mut request).await.unwrap();
            // Client already half-closed; the reply must still get through.
            upstream_app.write_all(&[b'r'; 300]).await.unwrap();
            upstream_app.shutdown().await.unwrap();
            request
        });
        let client = tokio::spawn(async move {
            client_app.write_all(&[b'q'; 100]).await.unwrap();
            client_app.shutdown().await.unwrap();
            let mut reply = Vec::new();
            client_app.read_to_end(&mut reply).await.unwrap();
            reply
        });

        let stats = relay(client_side, upstream_side, &metrics).await;

        assert_eq!(upstream.await.unwrap().len(), 100);
        assert_eq!(client.await.unwrap().len(), 300);
        assert_eq!(stats.client_to_upstream.bytes, 100);
        assert_eq!(stats.upstream_to_client.bytes, 300);
        assert!(stats.client_to_upstream.error.is_none());
        assert!(stats.upstream_to_client.error.is_none());

        let s = metrics.snapshot();
        assert_eq!(s.bytes_from_client, 100);
        assert_eq!(s.bytes_to_client, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_slower_direction() {
        let (mut client_app, client_side) = duplex(64);
        let (upstream_side, mut upstream_app) = duplex(64);
        let metrics = ProxyMetrics::new();

        let client = tokio::spawn(async move {
            client_app.write_all(b"ping").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            client_app.shutdown().await.unwrap();
            client_app
        });
        let upstream = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            upstream_app.write_all(b"pong").await.unwrap();
            upstream_app.shutdown().await.unwrap();
            upstream_app
        });

        let stats = relay(client_side, upstream_side, &metrics).await;
        let _ = (client.await.unwrap(), upstream.await.unwrap());

        let fast = stats.client_to_upstream.duration;
        let slow = stats.upstream_to_client.duration;
        assert!(fast >= Duration::from_millis(10) && fast < Duration::from_millis(20));
        assert!(slow >= Duration::from_millis(50) && slow < Duration::from_millis(60));
        assert_eq!(stats.latency(), slow);
        assert_eq!(
            metrics.snapshot().last_request_latency_seconds,
            slow.as_secs_f64()
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_recorded_not_returned() {
        let (mut client_app, client_side) = duplex(64);
        let (upstream_side, upstream_app) = duplex(64);
        drop(upstream_app);
        let metrics = ProxyMetrics::new();

        client_app.write_all(b"lost").await.unwrap();
        client_app.shutdown().await.unwrap();

        let stats = relay(client_side, upstream_side, &metrics).await;

        assert!(stats.client_to_upstream.error.is_some());
        assert_eq!(stats.client_to_upstream.bytes, 0);
        assert_eq!(stats.upstream_to_client.bytes, 0);
        assert_eq!(metrics.snapshot().bytes_from_client, 0);
    }
}
