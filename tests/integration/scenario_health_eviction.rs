//! Scenario 4 from spec §8: a registered cluster that never accepts a
//! connection is evicted after `fail_threshold` consecutive probe failures.
//! Driven through `HealthChecker::run_once` directly rather than waiting on
//! real wall-clock intervals, the same way `src/health.rs`'s own unit tests
//! do — three passes stand in for "3 × interval ≈ 45 s" at the configured
//! production cadence.

use std::collections::HashMap;
use std::time::Duration;

use otterscale::error::CoreError;
use otterscale::health::HealthChecker;
use otterscale::proto::registration::RegisterRequest;

use crate::support::{test_csr, test_service};

#[test_log::test(tokio::test)]
async fn an_unreachable_cluster_is_evicted_after_the_fail_threshold() {
    let (service, registry) = test_service(16);

    service
        .register(RegisterRequest {
            cluster: "cluster-unreachable".into(),
            agent_id: "agent-unreachable".into(),
            agent_version: "1.0.0".into(),
            csr_pem: test_csr("agent-unreachable"),
        })
        .await
        .unwrap();

    // Allocated host is a `127.x.y.z` address nothing is listening on, so
    // every dial genuinely fails rather than merely timing out slowly.
    let checker = HealthChecker::new(
        registry.clone(),
        Duration::from_millis(10),
        Duration::from_millis(50),
        3,
    );
    let mut failures = HashMap::new();

    for _ in 0..3 {
        checker.run_once(&mut failures).await;
    }

    assert!(matches!(
        registry.resolve("cluster-unreachable").await,
        Err(CoreError::ClusterNotFound(_))
    ));
    assert!(registry.snapshot().await.is_empty());
}
