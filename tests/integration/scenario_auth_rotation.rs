//! Scenario 3 from spec §8: re-registering the same agent identity rotates
//! its derived auth secret, because `sign_csr` mints a fresh serial each
//! time even for an identical CSR.

use otterscale::proto::registration::RegisterRequest;

use crate::support::{test_csr, test_service};

#[test_log::test(tokio::test)]
async fn reregistering_the_same_agent_rotates_its_auth_secret() {
    let (service, _registry) = test_service(16);
    let csr = test_csr("agent-a");

    let resp_1 = service
        .register(RegisterRequest {
            cluster: "cluster-z".into(),
            agent_id: "agent-a".into(),
            agent_version: "1.0.0".into(),
            csr_pem: csr.clone(),
        })
        .await
        .unwrap();
    let resp_2 = service
        .register(RegisterRequest {
            cluster: "cluster-z".into(),
            agent_id: "agent-a".into(),
            agent_version: "1.0.0".into(),
            csr_pem: csr,
        })
        .await
        .unwrap();

    assert_ne!(resp_1.auth, resp_2.auth);
    assert_ne!(resp_1.certificate, resp_2.certificate);
}
