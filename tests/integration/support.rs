//! Shared fixtures for the end-to-end scenarios, following the same
//! from-a-fixed-seed-CA, `TunnelListener::for_tests()` style the unit tests
//! in `src/registration.rs`/`src/registry.rs` already use — just assembled
//! from outside the crate instead of from within a `#[cfg(test)]` module.

use std::sync::Arc;

use otterscale::listener::TunnelListener;
use otterscale::registration::RegistrationService;
use otterscale::registry::TunnelRegistry;
use otterscale_pki::CertificateAuthority;

pub const SHARED_PORT: u16 = 16598;

pub fn test_ca() -> Arc<CertificateAuthority> {
    Arc::new(CertificateAuthority::new_from_seed(b"integration-test-seed-with-entropy").unwrap())
}

/// A registration service with its own registry/listener pair, `capacity`
/// addresses wide. Returns the registry alongside the service so tests can
/// assert on `resolve`/`snapshot` without reaching into the service.
pub fn test_service(capacity: usize) -> (RegistrationService, Arc<TunnelRegistry>) {
    let ca = test_ca();
    let listener = Arc::new(TunnelListener::for_tests());
    let registry = Arc::new(TunnelRegistry::new(SHARED_PORT, capacity, listener));
    let service = RegistrationService::new(ca, registry.clone(), SHARED_PORT);
    (service, registry)
}

/// A self-signed CSR for `common_name`, the same way an agent would build
/// one before calling `Register`.
pub fn test_csr(common_name: &str) -> String {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);
    params.serialize_request(&key_pair).unwrap().pem().unwrap()
}
