//! The tunnel listener (spec §4.3): the mTLS-authenticated gRPC server that
//! agents dial to open their reverse tunnel, plus the per-session forwarder
//! that exposes each agent's claimed loopback endpoint locally.
//!
//! Grounded directly on `lib/authly-connect/src/{tunnel,server,client}.rs`
//! (now generalized into the `tunnel-connect` lib crate): the `Frame`-stream
//! duplexing and `serve_https_tunneled`'s `tokio::select!`-against-a-
//! `CancellationToken` relay loop, and on the teacher's `tls.rs`
//! `main_service_tls_configurer`'s use of `futures_util::stream::unfold` to
//! drive a manually TLS-terminated accept loop rather than tonic's built-in
//! TLS. Unlike the teacher, whose mTLS carries the full authorization in the
//! certificate itself, this spec also needs a password and a per-user
//! single-endpoint regex constraint, so the listener additionally carries
//! its own `tokio::sync::RwLock<HashMap<...>>` user table, built in the
//! same lock-a-small-table style as the teacher's other in-memory tables.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use regex::Regex;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{info, warn};

use otterscale_pki::CertificateAuthority;
use tunnel_connect::server::{TunnelRelayHandler, TunnelServerImpl};
use tunnel_connect::{proto, relay, tunnel, TunnelAuthError, TunnelAuthenticator};

use crate::error::CoreError;
use crate::lifecycle::Listener;

/// Matches only the empty string; the bootstrap sentinel user is therefore
/// installed but can never actually claim a remote forward.
const BOOTSTRAP_CONSTRAINT: &str = "^$";
const BOOTSTRAP_USER: &str = "otterscale-bootstrap-sentinel";

struct AuthorizedUser {
    password: String,
    constraint: Regex,
}

struct ListenerState {
    users: HashMap<String, AuthorizedUser>,
}

/// Accepts mTLS reverse-tunnel connections on a fixed address and, for each
/// authenticated session, binds the agent's claimed loopback endpoint and
/// relays traffic into the tunnel as an HTTP/2 client.
pub struct TunnelListener {
    bind_addr: SocketAddr,
    tls_config: Arc<ServerConfig>,
    state: tokio::sync::RwLock<ListenerState>,
    started: AtomicBool,
    forwarders: CancellationToken,
}

impl TunnelListener {
    pub fn new(bind_addr: SocketAddr, ca: &CertificateAuthority, hostname: &str) -> Result<Self, CoreError> {
        crate::install_crypto_provider();

        let (server_cert_pem, server_key_pem) = ca
            .generate_server_cert(&[hostname.to_string()])
            .map_err(|err| CoreError::ConfigError(err.to_string()))?;

        let server_cert_der = rustls_pemfile::certs(&mut server_cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| CoreError::ConfigError(format!("server certificate: {err}")))?;
        let server_key_der = rustls_pemfile::private_key(&mut server_key_pem.as_bytes())
            .map_err(|err| CoreError::ConfigError(format!("server key: {err}")))?
            .ok_or_else(|| CoreError::ConfigError("no private key in generated server cert".into()))?;

        let mut root_store = RootCertStore::empty();
        root_store
            .add(ca.root_cert_der().der().clone())
            .map_err(|err| CoreError::ConfigError(err.to_string()))?;
        let client_verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
            .build()
            .map_err(|err| CoreError::ConfigError(err.to_string()))?;

        let mut tls_config = ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(server_cert_der, server_key_der)
            .map_err(|err| CoreError::ConfigError(err.to_string()))?;
        tls_config.alpn_protocols = vec![b"h2".to_vec()];

        let mut users = HashMap::new();
        users.insert(
            BOOTSTRAP_USER.to_string(),
            AuthorizedUser {
                password: random_password(),
                constraint: Regex::new(BOOTSTRAP_CONSTRAINT).expect("constant regex compiles"),
            },
        );

        Ok(Self {
            bind_addr,
            tls_config: Arc::new(tls_config),
            state: tokio::sync::RwLock::new(ListenerState { users }),
            started: AtomicBool::new(false),
            forwarders: CancellationToken::new(),
        })
    }

    /// A listener pre-marked as started, bound to no real socket. For tests
    /// (including the `tests/` integration suite, which links against this
    /// crate as an ordinary dependency and so can't see anything gated
    /// behind `#[cfg(test)]`) that exercise `add_user`/`delete_user`/the
    /// registry without running the actual accept loop.
    pub fn for_tests() -> Self {
        let ca = CertificateAuthority::new_from_seed(b"listener-test-seed-with-entropy").unwrap();
        let listener = Self::new("127.0.0.1:0".parse().unwrap(), &ca, "localhost").unwrap();
        listener.started.store(true, Ordering::SeqCst);
        listener
    }

    pub async fn add_user(
        &self,
        user: String,
        password: String,
        endpoint_constraint: String,
    ) -> Result<(), CoreError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(CoreError::NotReady);
        }
        let constraint = Regex::new(&endpoint_constraint)
            .map_err(|err| CoreError::ConfigError(err.to_string()))?;
        let mut state = self.state.write().await;
        state.users.insert(user, AuthorizedUser { password, constraint });
        Ok(())
    }

    pub async fn delete_user(&self, user: &str) {
        let mut state = self.state.write().await;
        state.users.remove(user);
    }

    fn parse_remote_spec(remote_spec: &str) -> Option<SocketAddr> {
        let rest = remote_spec.strip_prefix("R:")?;
        let mut parts = rest.splitn(3, ':');
        let host = parts.next()?;
        let port: u16 = parts.next()?.parse().ok()?;
        format!("{host}:{port}").parse().ok()
    }
}

#[tonic::async_trait]
impl TunnelAuthenticator for TunnelListener {
    async fn authenticate(
        &self,
        agent_id: &str,
        password: &str,
        remote_spec: &str,
    ) -> Result<(), TunnelAuthError> {
        let state = self.state.read().await;
        let user = state.users.get(agent_id).ok_or(TunnelAuthError::UnknownUser)?;
        if user.password != password {
            return Err(TunnelAuthError::InvalidAuth);
        }
        if !user.constraint.is_match(remote_spec) {
            return Err(TunnelAuthError::ConstraintMismatch);
        }
        Ok(())
    }
}

impl TunnelRelayHandler for TunnelListener {
    fn on_tunnel_opened(
        &self,
        agent_id: String,
        remote_spec: String,
        tunnel: tunnel::ServerSideTunnel,
        cancel: CancellationToken,
    ) {
        let Some(forward_addr) = Self::parse_remote_spec(&remote_spec) else {
            warn!(%agent_id, %remote_spec, "could not parse remote spec, dropping tunnel");
            return;
        };

        tokio::spawn(async move {
            let service = match relay::relay_as_http2_client(tunnel).await {
                Ok(service) => service,
                Err(err) => {
                    warn!(%agent_id, %err, "failed to establish http2 relay over tunnel");
                    return;
                }
            };

            if let Err(err) = serve_forward(forward_addr, service, cancel).await {
                warn!(%agent_id, %forward_addr, %err, "forwarding listener ended with error");
            }
        });
    }
}

/// Bind `addr` and serve every accepted plain-TCP connection through
/// `service`, which forwards into the reverse tunnel. Mirrors the agent
/// side's `serve_over_tunnel`, but here the tunnel is the upstream, not the
/// local socket.
async fn serve_forward(
    addr: SocketAddr,
    service: relay::RelayedHttpService,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "forwarding endpoint bound");

    loop {
        tokio::select! {
            biased;
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let service = service.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    use hyper_util::rt::{TokioExecutor, TokioIo};
                    let connection_builder =
                        hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
                    let conn = connection_builder.serve_connection_with_upgrades(
                        TokioIo::new(stream),
                        hyper::service::service_fn(move |req: http::Request<hyper::body::Incoming>| {
                            let mut service = service.clone();
                            async move {
                                tower::ServiceExt::ready(&mut service).await?;
                                let req = req.map(tonic::body::Body::new);
                                tower::Service::call(&mut service, req).await
                            }
                        }),
                    );
                    tokio::pin!(conn);
                    tokio::select! {
                        biased;
                        result = conn.as_mut() => {
                            if let Err(err) = result {
                                info!(%peer, ?err, "forwarded connection ended with error");
                            }
                        }
                        _ = cancel.cancelled() => {
                            conn.as_mut().graceful_shutdown();
                        }
                    }
                });
            }
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

fn random_password() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[tonic::async_trait]
impl Listener for TunnelListener {
    fn name(&self) -> &str {
        "tunnel-listener"
    }

    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), CoreError> {
        let tcp_listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|err| CoreError::ConfigError(format!("binding {}: {err}", self.bind_addr)))?;
        let tls_acceptor = TlsAcceptor::from(self.tls_config.clone());

        self.started.store(true, Ordering::SeqCst);
        info!(addr = %self.bind_addr, "tunnel listener accepting connections");

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

        let server_impl = TunnelServerImpl {
            authenticator: self.clone(),
            handler: self.clone(),
            cancel: self.forwarders.child_token(),
        };

        Server::builder()
            .add_service(proto::tunnel_server::TunnelServer::new(server_impl))
            .serve_with_incoming_shutdown(incoming, cancel.cancelled())
            .await
            .map_err(|err| CoreError::Transient(err.to_string()))?;
        Ok(())
    }

    async fn stop(self: Arc<Self>) -> Result<(), CoreError> {
        self.forwarders.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remote_spec_prefix() {
        let addr = TunnelListener::parse_remote_spec("R:127.4.9.201:16598:127.0.0.1:8443").unwrap();
        assert_eq!(addr, "127.4.9.201:16598".parse().unwrap());
    }

    #[test]
    fn rejects_malformed_remote_spec() {
        assert!(TunnelListener::parse_remote_spec("not-a-spec").is_none());
    }

    #[tokio::test]
    async fn bootstrap_user_never_authenticates_a_real_request() {
        let listener = TunnelListener::for_tests();
        let err = listener.authenticate(BOOTSTRAP_USER, "wrong", "R:127.0.0.1:1:x").await;
        assert!(matches!(err, Err(TunnelAuthError::InvalidAuth)));
    }

    #[tokio::test]
    async fn add_user_then_authenticate_succeeds_within_constraint() {
        let listener = TunnelListener::for_tests();
        listener
            .add_user(
                "agent-a".to_string(),
                "secret".to_string(),
                "^R:127.4.9.201:16598(:.*)?$".to_string(),
            )
            .await
            .unwrap();

        assert!(listener
            .authenticate("agent-a", "secret", "R:127.4.9.201:16598:127.0.0.1:8443")
            .await
            .is_ok());
        assert!(matches!(
            listener.authenticate("agent-a", "wrong", "R:127.4.9.201:16598").await,
            Err(TunnelAuthError::InvalidAuth)
        ));
        assert!(matches!(
            listener.authenticate("agent-a", "secret", "R:10.0.0.1:16598").await,
            Err(TunnelAuthError::ConstraintMismatch)
        ));
    }

    #[tokio::test]
    async fn delete_user_revokes_access() {
        let listener = TunnelListener::for_tests();
        listener
            .add_user("agent-a".to_string(), "secret".to_string(), "^R:.*$".to_string())
            .await
            .unwrap();
        listener.delete_user("agent-a").await;

        assert!(matches!(
            listener.authenticate("agent-a", "secret", "R:anything").await,
            Err(TunnelAuthError::UnknownUser)
        ));
    }

    #[tokio::test]
    async fn add_user_before_start_is_not_ready() {
        let ca = CertificateAuthority::new_from_seed(b"listener-test-seed-with-entropy").unwrap();
        let listener = TunnelListener::new("127.0.0.1:0".parse().unwrap(), &ca, "localhost").unwrap();
        let err = listener
            .add_user("agent-a".to_string(), "secret".to_string(), "^R:.*$".to_string())
            .await;
        assert!(matches!(err, Err(CoreError::NotReady)));
    }
}
