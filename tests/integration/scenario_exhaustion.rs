//! Scenario 5 from spec §8: with a pool of size N=16 (test configuration),
//! N registrations succeed, the N+1-th is `Exhausted`, and deregistering
//! any one cluster frees a slot for the next registration.

use otterscale::error::CoreError;
use otterscale::proto::registration::RegisterRequest;

use crate::support::{test_csr, test_service};

const POOL_SIZE: usize = 16;

#[test_log::test(tokio::test)]
async fn pool_exhausts_at_its_capacity_and_recovers_on_release() {
    let (service, registry) = test_service(POOL_SIZE);

    for i in 0..POOL_SIZE {
        let cluster = format!("cluster-{i}");
        let agent_id = format!("agent-{i}");
        service
            .register(RegisterRequest {
                cluster: cluster.clone(),
                agent_id: agent_id.clone(),
                agent_version: "1.0.0".into(),
                csr_pem: test_csr(&agent_id),
            })
            .await
            .unwrap_or_else(|err| panic!("registration {i} should succeed, got {err}"));
    }

    let overflow = service
        .register(RegisterRequest {
            cluster: "cluster-overflow".into(),
            agent_id: "agent-overflow".into(),
            agent_version: "1.0.0".into(),
            csr_pem: test_csr("agent-overflow"),
        })
        .await;
    assert!(matches!(overflow, Err(CoreError::Exhausted)));

    registry.deregister("cluster-0").await;

    service
        .register(RegisterRequest {
            cluster: "cluster-overflow".into(),
            agent_id: "agent-overflow".into(),
            agent_version: "1.0.0".into(),
            csr_pem: test_csr("agent-overflow"),
        })
        .await
        .expect("releasing one host must allow exactly one more registration");
}
