//! Health checker (spec §4.5). No direct teacher analogue exists — the
//! teacher has no polling health-check loop — so this is grounded in the
//! teacher's recurring-task idiom instead: the `tokio::select! { _ = sleep
//! => ..., _ = cancel.cancelled() => return }` loop used for the service
//! pinger in the teacher's `src/lib.rs::serve()`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::CoreError;
use crate::lifecycle::Listener;
use crate::registry::TunnelRegistry;

pub struct HealthChecker {
    registry: Arc<TunnelRegistry>,
    interval: Duration,
    dial_timeout: Duration,
    fail_threshold: u32,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        interval: Duration,
        dial_timeout: Duration,
        fail_threshold: u32,
    ) -> Self {
        Self {
            registry,
            interval,
            dial_timeout,
            fail_threshold,
        }
    }

    /// One probe pass over the current snapshot. Public so tests (and
    /// property tests driving faster-than-real-time scenarios) can call it
    /// directly instead of waiting on the interval ticker.
    pub async fn run_once(&self, failures: &mut HashMap<String, u32>) {
        let snapshot = self.registry.snapshot().await;

        // Entries for clusters no longer present are pruned so memory
        // tracks live state (spec §4.5).
        failures.retain(|cluster, _| snapshot.contains_key(cluster));

        for (cluster, host) in snapshot {
            let addr = (host, self.registry.shared_port());
            let reachable = matches!(
                tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr)).await,
                Ok(Ok(_))
            );

            if reachable {
                failures.remove(&cluster);
                continue;
            }

            let count = failures.entry(cluster.clone()).or_insert(0);
            *count += 1;
            if *count >= self.fail_threshold {
                warn!(cluster, %host, failures = *count, "health check failures exceeded threshold");
                self.registry.deregister(&cluster).await;
                failures.remove(&cluster);
            }
        }
    }
}

#[tonic::async_trait]
impl Listener for HealthChecker {
    fn name(&self) -> &str {
        "health-checker"
    }

    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), CoreError> {
        let mut failures = HashMap::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it so the checker's
        // cadence starts from `interval` after boot, not from zero.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    self.run_once(&mut failures).await;
                }
            }
        }
    }

    async fn stop(self: Arc<Self>) -> Result<(), CoreError> {
        Ok(())
    }
}
