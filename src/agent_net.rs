//! Real, network-facing implementations of the [`crate::agent`] module's
//! [`crate::agent::RegistrationClient`] and [`crate::agent::TunnelDialer`]
//! traits, plus the local HTTP forwarder the reverse tunnel serves.
//!
//! Grounded on `lib/authly-service/src/authority_mandate/submission/mandate.rs`'s
//! `mandate_execute_submission`: generate a fresh keypair and CSR locally
//! ("The private key never leaves the mandate"), dial the remote side over
//! a TLS channel that, before any certificate exists to pin to, has no
//! choice but to trust on first use — the teacher's own `NoTrustVerifier`
//! dangerous-verifier pattern for exactly this bootstrap moment.

use std::sync::Arc;

use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_util::sync::CancellationToken;
use tonic::transport::{ClientTlsConfig, Endpoint};
use tower::Service;
use tracing::info;

use crate::agent::{AgentRegistration, RegistrationClient, RunningTunnel, TunnelDialer};
use crate::error::CoreError;
use crate::proto::registration::{
    registration_client::RegistrationClient as GrpcClient, RegisterRequest,
};

/// Accepts any server certificate. Used only for the registration dial
/// when no pinned bootstrap CA is configured: the registration exchange
/// *is* the trust bootstrap (spec §4.4 design rationale), the same way the
/// teacher's mandate-submission client has nothing to pin to before it
/// holds a signed certificate of its own.
#[derive(Debug)]
struct NoTrustVerifier;

impl ServerCertVerifier for NoTrustVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// Build the TLS client config used to dial the registration endpoint.
/// Pins to `bootstrap_ca_pem` when the operator supplied one out-of-band;
/// otherwise trusts any certificate, deferring real trust establishment to
/// the signed certificate registration itself hands back.
fn registration_tls_config(bootstrap_ca_pem: Option<&str>) -> anyhow::Result<ClientConfig> {
    crate::install_crypto_provider();

    match bootstrap_ca_pem {
        Some(ca_pem) => {
            let mut roots = RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
                roots.add(cert?)?;
            }
            Ok(ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth())
        }
        None => Ok(ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoTrustVerifier))
            .with_no_client_auth()),
    }
}

/// Dials the hub's registration RPC, generating a fresh keypair/CSR per
/// attempt (spec §4.6: every `Registering` entry is a brand new attempt).
pub struct GrpcRegistrationClient {
    registration_server_url: String,
    cluster: String,
    agent_id: String,
    agent_version: String,
    bootstrap_ca_pem: Option<String>,
}

impl GrpcRegistrationClient {
    pub fn new(
        registration_server_url: String,
        cluster: String,
        agent_id: String,
        agent_version: String,
        bootstrap_ca_pem: Option<String>,
    ) -> Self {
        Self {
            registration_server_url,
            cluster,
            agent_id,
            agent_version,
            bootstrap_ca_pem,
        }
    }
}

#[tonic::async_trait]
impl RegistrationClient for GrpcRegistrationClient {
    async fn register(&self) -> Result<AgentRegistration, CoreError> {
        let key_pair = KeyPair::generate()
            .map_err(|err| CoreError::ConfigError(format!("generating agent keypair: {err}")))?;
        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|err| CoreError::ConfigError(err.to_string()))?;
        params
            .distinguished_name
            .push(DnType::CommonName, self.agent_id.clone());
        let csr_pem = params
            .serialize_request(&key_pair)
            .and_then(|csr| csr.pem())
            .map_err(|err| CoreError::ConfigError(format!("serializing CSR: {err}")))?;

        let tls_config = registration_tls_config(self.bootstrap_ca_pem.as_deref())
            .map_err(|err| CoreError::Transient(err.to_string()))?;

        let channel = Endpoint::from_shared(self.registration_server_url.clone())
            .map_err(|err| CoreError::ConfigError(err.to_string()))?
            .tls_config(ClientTlsConfig::new().rustls_client_config(tls_config))
            .map_err(|err| CoreError::ConfigError(err.to_string()))?
            .connect()
            .await
            .map_err(|err| CoreError::Transient(err.to_string()))?;

        let response = GrpcClient::new(channel)
            .register(RegisterRequest {
                cluster: self.cluster.clone(),
                agent_id: self.agent_id.clone(),
                agent_version: self.agent_version.clone(),
                csr_pem,
            })
            .await
            .map_err(|status| match status.code() {
                tonic::Code::InvalidArgument => CoreError::BadRequest(status.message().to_string()),
                tonic::Code::ResourceExhausted => CoreError::Exhausted,
                tonic::Code::Unauthenticated => CoreError::AuthFailed(status.message().to_string()),
                _ => CoreError::Transient(status.message().to_string()),
            })?
            .into_inner();

        Ok(AgentRegistration {
            endpoint: response.endpoint,
            certificate_pem: response.certificate,
            ca_certificate_pem: response.ca_certificate,
            client_key_pem: key_pair.serialize_pem(),
            auth: response.auth,
        })
    }
}

/// Forwards HTTP requests arriving over the reverse tunnel to the agent's
/// local Kubernetes API proxy. Out of the core's scope in substance (the
/// proxy itself is an opaque handler per spec §6), but something has to
/// occupy the type parameter `connect_and_serve` expects, so this is the
/// minimal plain reverse-proxy glue.
#[derive(Clone)]
pub struct LocalProxyService {
    client: hyper_util::client::legacy::Client<
        hyper_util::client::legacy::connect::HttpConnector,
        tonic::body::Body,
    >,
    local_port: u16,
}

impl LocalProxyService {
    pub fn new(local_port: u16) -> Self {
        Self {
            client: hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
                .build_http(),
            local_port,
        }
    }
}

impl Service<http::Request<hyper::body::Incoming>> for LocalProxyService {
    type Response = http::Response<tonic::body::Body>;
    type Error = Box<dyn std::error::Error + Send + Sync>;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        Service::poll_ready(&mut self.client, cx).map_err(Into::into)
    }

    fn call(&mut self, req: http::Request<hyper::body::Incoming>) -> Self::Future {
        let mut client = self.client.clone();
        let local_port = self.local_port;
        Box::pin(async move {
            let mut parts = req.uri().clone().into_parts();
            parts.scheme = Some(http::uri::Scheme::HTTP);
            parts.authority = Some(format!("127.0.0.1:{local_port}").parse()?);
            let uri = http::Uri::from_parts(parts)?;

            let (mut head, body) = req.into_parts();
            head.uri = uri;
            let forwarded = http::Request::from_parts(head, tonic::body::Body::new(body));

            let response = client.call(forwarded).await?;
            Ok(response.map(tonic::body::Body::new))
        })
    }
}

/// Wraps the `JoinHandle` from `tunnel_connect::client::connect_and_serve`
/// so [`crate::agent::AgentSession`] can `wait()` on it without knowing
/// about tasks.
pub struct RealRunningTunnel {
    handle: tokio::task::JoinHandle<Result<(), String>>,
}

#[tonic::async_trait]
impl RunningTunnel for RealRunningTunnel {
    async fn wait(&mut self) -> Option<String> {
        match (&mut self.handle).await {
            Ok(Ok(())) => None,
            Ok(Err(message)) => Some(message),
            Err(join_err) => Some(join_err.to_string()),
        }
    }
}

/// Dials the hub's tunnel listener with mTLS built from the just-issued
/// certificate, claims `R:<endpoint>:127.0.0.1:<local_port>`, and serves
/// [`LocalProxyService`] over it.
pub struct RealTunnelDialer {
    tunnel_server_url: String,
    agent_id: String,
    local_port: u16,
}

impl RealTunnelDialer {
    pub fn new(tunnel_server_url: String, agent_id: String, local_port: u16) -> Self {
        Self {
            tunnel_server_url,
            agent_id,
            local_port,
        }
    }

    fn mtls_config(registration: &AgentRegistration) -> anyhow::Result<ClientConfig> {
        crate::install_crypto_provider();

        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut registration.ca_certificate_pem.as_bytes()) {
            roots.add(cert?)?;
        }

        let cert_chain: Vec<_> =
            rustls_pemfile::certs(&mut registration.certificate_pem.as_bytes()).collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut registration.client_key_pem.as_bytes())?
            .ok_or_else(|| anyhow::anyhow!("no private key in materialized agent credentials"))?;

        Ok(ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(cert_chain, key)?)
    }
}

#[tonic::async_trait]
impl TunnelDialer for RealTunnelDialer {
    async fn dial(
        &self,
        registration: &AgentRegistration,
        cancel: CancellationToken,
    ) -> Result<Box<dyn RunningTunnel + Send>, String> {
        let tls_config = Self::mtls_config(registration).map_err(|err| err.to_string())?;

        let (user, password) = registration
            .auth
            .split_once(':')
            .ok_or_else(|| "auth string missing ':' separator".to_string())?;
        let remote_spec = format!("R:{}:127.0.0.1:{}", registration.endpoint, self.local_port);

        info!(agent_id = %self.agent_id, %remote_spec, "dialing reverse tunnel");

        let handle = tunnel_connect::client::connect_and_serve(
            self.tunnel_server_url.clone(),
            Arc::new(tls_config),
            user,
            password,
            &remote_spec,
            LocalProxyService::new(self.local_port),
            cancel,
        )
        .await
        .map_err(|err| err.to_string())?;

        Ok(Box::new(RealRunningTunnel { handle }))
    }
}
