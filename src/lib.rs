#![deny(unsafe_code)]

use std::sync::Arc;

use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod agent;
pub mod agent_net;
pub mod env_config;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod listener;
pub mod proto;
pub mod registration;
pub mod registry;

pub use env_config::EnvConfig;
pub use error::CoreError;

/// rustls 0.23 requires a process-level default `CryptoProvider` before any
/// `ServerConfig`/`ClientConfig` builder runs, or it panics. Idempotent, so
/// every TLS-config constructor in this crate calls it defensively rather
/// than relying on a single well-known call site — the same defensive
/// `let _ = ...install_default()` the teacher sprinkles across its own
/// TLS-touching entry points (`tls::init_tls_ring`) and tests.
pub(crate) fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

use health::HealthChecker;
use listener::TunnelListener;
use otterscale_pki::CertificateAuthority;
use registration::{RegistrationListener, RegistrationService};
use registry::TunnelRegistry;

/// Run the hub: instantiate the PKI from the configured seed, build the
/// registry and tunnel listener, and hand components 4–6 to the lifecycle
/// coordinator alongside the registration listener (spec §2 data flow).
///
/// `parent_cancel` lets the caller (typically a termination-signal handler
/// installed in `main`) trigger the same graceful-shutdown path used when
/// one listener fails.
pub async fn serve(env_config: EnvConfig, parent_cancel: CancellationToken) -> anyhow::Result<()> {
    let ca = Arc::new(CertificateAuthority::new_from_seed(
        env_config.tunnel_key_seed.expose_secret().as_bytes(),
    )?);

    info!(
        "otterscale hub v{} starting, tunnel CA root:\n{}",
        env!("CARGO_PKG_VERSION"),
        ca.root_cert_pem()
    );

    let tunnel_listener = Arc::new(TunnelListener::new(
        env_config.tunnel_address,
        &ca,
        &env_config.tunnel_hostname,
    )?);

    let registry = Arc::new(TunnelRegistry::full_capacity(
        env_config.shared_port,
        tunnel_listener.clone(),
    ));

    let registration_service = Arc::new(RegistrationService::new(
        ca.clone(),
        registry.clone(),
        env_config.shared_port,
    ));
    let registration_listener = Arc::new(RegistrationListener::new(
        env_config.registration_address,
        &ca,
        &env_config.tunnel_hostname,
        registration_service,
    )?);

    let health_checker = Arc::new(HealthChecker::new(
        registry.clone(),
        env_config.health_check_interval(),
        env_config.health_check_timeout(),
        env_config.health_check_fail_threshold,
    ));

    info!(
        interval = %humantime::format_duration(env_config.health_check_interval()),
        fail_threshold = env_config.health_check_fail_threshold,
        "health checker configured"
    );

    let listeners: Vec<Arc<dyn lifecycle::Listener>> = vec![
        tunnel_listener,
        registration_listener,
        health_checker,
    ];

    lifecycle::serve(
        listeners,
        parent_cancel,
        env_config.shutdown_timeout(),
    )
    .await?;

    Ok(())
}

/// Run a single agent session loop until `cancel` fires (spec §4.6). Wires
/// the real network-facing [`agent_net::GrpcRegistrationClient`] and
/// [`agent_net::RealTunnelDialer`] into [`agent::AgentSession`].
pub async fn run_agent(env_config: EnvConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let cluster = env_config
        .cluster
        .clone()
        .ok_or_else(|| anyhow::anyhow!("agent mode requires --cluster"))?;

    let agent_id = format!("{cluster}-agent");

    let bootstrap_ca_pem = match &env_config.agent_bootstrap_ca_path {
        Some(path) => Some(std::fs::read_to_string(path)?),
        None => None,
    };

    let registration_client = Arc::new(agent_net::GrpcRegistrationClient::new(
        env_config.registration_server_url.clone(),
        cluster,
        agent_id.clone(),
        env_config.agent_version.clone(),
        bootstrap_ca_pem,
    ));

    let dialer = Arc::new(agent_net::RealTunnelDialer::new(
        env_config.tunnel_server_url.clone(),
        agent_id,
        env_config.local_port,
    ));

    let mut session = agent::AgentSession::new(
        registration_client,
        dialer,
        std::time::Duration::from_millis(env_config.backoff_base_ms),
        std::time::Duration::from_millis(env_config.backoff_max_ms),
    );

    session.run(cancel).await;
    Ok(())
}
