//! Registration service (spec §4.4): the hub-side operation an agent calls
//! to join (or re-join) the fleet. Grounded on the teacher's
//! `authority_fulfill_submission` algorithm shape in
//! `submission/authority.rs` — validate, sign, install — generalized from
//! JWT submission-code validation to this spec's direct
//! cluster/agent-identity request shape.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustls::{RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Result as TonicResult};
use tracing::{info, warn};

use otterscale_pki::CertificateAuthority;

use crate::error::CoreError;
use crate::lifecycle::Listener;
use crate::proto::registration::{
    registration_server::{Registration, RegistrationServer},
    RegisterRequest, RegisterResponse,
};
use crate::registry::TunnelRegistry;

/// Implements the pure request/response half of registration (spec §4.4
/// steps 1–4), independent of how it is exposed on the wire. Kept separate
/// from [`RegistrationListener`] so tests can exercise it without binding a
/// socket, the way `registry` module's tests construct a [`TunnelRegistry`]
/// directly.
pub struct RegistrationService {
    ca: Arc<CertificateAuthority>,
    registry: Arc<TunnelRegistry>,
    shared_port: u16,
}

impl RegistrationService {
    pub fn new(ca: Arc<CertificateAuthority>, registry: Arc<TunnelRegistry>, shared_port: u16) -> Self {
        Self {
            ca,
            registry,
            shared_port,
        }
    }

    pub async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse, CoreError> {
        if req.cluster.trim().is_empty() {
            return Err(CoreError::BadRequest("cluster must not be empty".into()));
        }
        if req.agent_id.trim().is_empty() {
            return Err(CoreError::BadRequest("agent_id must not be empty".into()));
        }

        // Step 1: sign. May fail `BadRequest` on a malformed or
        // self-inconsistent CSR; the serial (and thus the derived
        // password) is fresh even if this is a CSR we've seen before.
        let cert_pem = self.ca.sign_csr(&req.csr_pem)?;

        // Step 2: derive the auth string independently recomputable by the
        // agent from the same signed certificate.
        let auth = self.ca.derive_auth(&req.agent_id, &cert_pem);
        let (_, password) = auth
            .split_once(':')
            .expect("derive_auth always returns \"user:password\"");

        // Step 3: evict-old → release-old → allocate-new → authorize-new →
        // install, all under the registry's single writer lock.
        let host = self
            .registry
            .register(&req.cluster, &req.agent_id, &req.agent_version, password)
            .await?;

        let fingerprint = public_key_fingerprint(&cert_pem).unwrap_or_default();

        info!(cluster = %req.cluster, agent_id = %req.agent_id, %host, "cluster registered");

        Ok(RegisterResponse {
            endpoint: format!("{host}:{}", self.shared_port),
            certificate: cert_pem,
            ca_certificate: self.ca.root_cert_pem().to_string(),
            fingerprint,
            auth,
        })
    }
}

/// SHA-256 of the agent's public key (the full SubjectPublicKeyInfo DER),
/// hex-encoded, for the legacy out-of-band verification path (spec §6).
/// Returns `None` rather than failing registration outright if the freshly
/// signed certificate somehow doesn't parse; the field is documented as
/// optional.
fn public_key_fingerprint(cert_pem: &str) -> Option<String> {
    let pem = pem::parse(cert_pem).ok()?;
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(pem.contents()).ok()?;
    let spki_der = &cert.public_key().subject_public_key.data;
    let mut hasher = Sha256::new();
    hasher.update(spki_der);
    Some(hex::encode(hasher.finalize()))
}

#[tonic::async_trait]
impl Registration for RegistrationService {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> TonicResult<Response<RegisterResponse>> {
        let response = RegistrationService::register(self, request.into_inner()).await?;
        Ok(Response::new(response))
    }
}

/// Binds the registration RPC on its own plain-TLS (no client cert
/// required — an agent has no certificate yet) listener, so it can run
/// under the same [`crate::lifecycle`] coordinator as the mTLS tunnel
/// listener and the health checker.
///
/// The registration channel is unauthenticated at the transport level: the
/// signed-CSR exchange *is* the trust bootstrap, the same way a join-token
/// flow trusts the first contact and verifies everything after. Once an
/// agent holds its signed certificate and the CA root, all further traffic
/// (the reverse tunnel) is mutually authenticated.
pub struct RegistrationListener {
    bind_addr: SocketAddr,
    tls_config: Arc<ServerConfig>,
    service: Arc<RegistrationService>,
    started: AtomicBool,
}

impl RegistrationListener {
    pub fn new(
        bind_addr: SocketAddr,
        ca: &CertificateAuthority,
        hostname: &str,
        service: Arc<RegistrationService>,
    ) -> Result<Self, CoreError> {
        crate::install_crypto_provider();

        let (cert_pem, key_pem) = ca
            .generate_server_cert(&[hostname.to_string()])
            .map_err(|err| CoreError::ConfigError(err.to_string()))?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| CoreError::ConfigError(format!("server certificate: {err}")))?;
        let key_der = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|err| CoreError::ConfigError(format!("server key: {err}")))?
            .ok_or_else(|| CoreError::ConfigError("no private key in generated server cert".into()))?;

        let mut tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_der, key_der)
            .map_err(|err| CoreError::ConfigError(err.to_string()))?;
        tls_config.alpn_protocols = vec![b"h2".to_vec()];

        Ok(Self {
            bind_addr,
            tls_config: Arc::new(tls_config),
            service,
            started: AtomicBool::new(false),
        })
    }

    #[cfg(test)]
    pub fn root_cert_store(ca: &CertificateAuthority) -> RootCertStore {
        let mut store = RootCertStore::empty();
        store.add(ca.root_cert_der().der().clone()).unwrap();
        store
    }
}

#[tonic::async_trait]
impl Listener for RegistrationListener {
    fn name(&self) -> &str {
        "registration-listener"
    }

    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), CoreError> {
        let tcp_listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|err| CoreError::ConfigError(format!("binding {}: {err}", self.bind_addr)))?;
        let tls_acceptor = TlsAcceptor::from(self.tls_config.clone());

        self.started.store(true, Ordering::SeqCst);
        info!(addr = %self.bind_addr, "registration listener accepting connections");

        let incoming = futures_util::stream::unfold(
            (tcp_listener, tls_acceptor),
            |(tcp_listener, tls_acceptor)| async move {
                loop {
                    match tcp_listener.accept().await {
                        Ok((tcp_stream, peer)) => match tls_acceptor.accept(tcp_stream).await {
                            Ok(tls_stream) => {
                                return Some((Ok(tls_stream), (tcp_listener, tls_acceptor)));
                            }
                            Err(err) => {
                                warn!(%peer, %err, "TLS handshake failed");
                                continue;
                            }
                        },
                        Err(err) => return Some((Err::<_, std::io::Error>(err), (tcp_listener, tls_acceptor))),
                    }
                }
            },
        );

        let registration_service = RegistrationGrpc {
            inner: self.service.clone(),
        };

        Server::builder()
            .add_service(RegistrationServer::new(registration_service))
            .serve_with_incoming_shutdown(incoming, cancel.cancelled())
            .await
            .map_err(|err| CoreError::Transient(err.to_string()))?;
        Ok(())
    }

    async fn stop(self: Arc<Self>) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Thin forwarding shim so [`RegistrationService`] itself stays free of
/// `tonic`'s service-trait plumbing and can be unit-tested directly.
struct RegistrationGrpc {
    inner: Arc<RegistrationService>,
}

#[tonic::async_trait]
impl Registration for RegistrationGrpc {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> TonicResult<Response<RegisterResponse>> {
        self.inner.register(request).await
    }
}
