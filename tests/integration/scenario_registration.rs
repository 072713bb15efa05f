//! Scenarios 1 and 2 from spec §8's concrete end-to-end list.

use otterscale::error::CoreError;
use otterscale::proto::registration::RegisterRequest;

use crate::support::{test_csr, test_service, SHARED_PORT};

#[test_log::test(tokio::test)]
async fn two_clusters_get_distinct_endpoints_and_resolve() {
    let (service, registry) = test_service(16);

    let resp_a = service
        .register(RegisterRequest {
            cluster: "cluster-a".into(),
            agent_id: "agent-a".into(),
            agent_version: "1.0.0".into(),
            csr_pem: test_csr("agent-a"),
        })
        .await
        .unwrap();
    let resp_b = service
        .register(RegisterRequest {
            cluster: "cluster-b".into(),
            agent_id: "agent-b".into(),
            agent_version: "1.0.0".into(),
            csr_pem: test_csr("agent-b"),
        })
        .await
        .unwrap();

    assert!(resp_a.endpoint.ends_with(&format!(":{SHARED_PORT}")));
    assert!(resp_b.endpoint.ends_with(&format!(":{SHARED_PORT}")));

    let host_a = resp_a.endpoint.rsplit_once(':').unwrap().0;
    let host_b = resp_b.endpoint.rsplit_once(':').unwrap().0;
    assert_ne!(host_a, host_b);

    assert_eq!(registry.resolve("cluster-a").await.unwrap(), format!("http://{host_a}:{SHARED_PORT}"));
    assert_eq!(registry.resolve("cluster-b").await.unwrap(), format!("http://{host_b}:{SHARED_PORT}"));
}

#[test_log::test(tokio::test)]
async fn reregistering_a_cluster_leaves_exactly_one_entry_pointing_at_the_newest_agent() {
    let (service, registry) = test_service(16);

    service
        .register(RegisterRequest {
            cluster: "cluster-r".into(),
            agent_id: "agent-r-1".into(),
            agent_version: "1.0.0".into(),
            csr_pem: test_csr("agent-r-1"),
        })
        .await
        .unwrap();
    let resp_second = service
        .register(RegisterRequest {
            cluster: "cluster-r".into(),
            agent_id: "agent-r-2".into(),
            agent_version: "1.0.1".into(),
            csr_pem: test_csr("agent-r-2"),
        })
        .await
        .unwrap();

    let snapshot = registry.snapshot().await;
    assert_eq!(snapshot.len(), 1);

    let resolved = registry.resolve("cluster-r").await.unwrap();
    assert_eq!(resolved, format!("http://{}", resp_second.endpoint));

    // Evicted first registration's host is not mistaken for a second entry.
    assert!(matches!(
        registry.resolve("cluster-q").await,
        Err(CoreError::ClusterNotFound(_))
    ));
}
