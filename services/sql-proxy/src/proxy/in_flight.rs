//! Tracking of connection tasks that have been spawned but not yet finished.
//!
//! A connection is in flight from the moment it is admitted, so this also
//! covers connections that are still dialing or negotiating TLS, which
//! `connections_open` does not see yet.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared count of in-flight connection tasks.
#[derive(Debug, Clone)]
pub struct InFlight {
    count: Arc<watch::Sender<usize>>,
}

impl InFlight {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    /// Number of connection tasks currently alive.
    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Register one task; it stays counted until the guard is dropped.
    pub fn enter(&self) -> InFlightGuard {
        self.count.send_modify(|n| *n += 1);
        InFlightGuard {
            count: Arc::clone(&self.count),
        }
    }

    /// Resolve once no connection task is alive.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps one task counted in [`InFlight`] while alive.
#[derive(Debug)]
pub struct InFlightGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_guard_counts_until_dropped() {
        let in_flight = InFlight::new();
        let first = in_flight.enter();
        let second = in_flight.clone().enter();
        assert_eq!(in_flight.count(), 2);

        drop(first);
        assert_eq!(in_flight.count(), 1);
        drop(second);
        assert_eq!(in_flight.count(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_empty() {
        let in_flight = InFlight::new();
        timeout(Duration::from_millis(100), in_flight.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_waits_for_last_guard() {
        let in_flight = InFlight::new();
        let guard = in_flight.enter();

        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(guard);
        });

        assert!(timeout(Duration::from_millis(100), in_flight.wait_idle())
            .await
            .is_err());
        timeout(Duration::from_millis(500), in_flight.wait_idle())
            .await
            .unwrap();
        task.await.unwrap();
    }
}
