pub mod client;
pub mod relay;
pub mod server;
pub mod tunnel;

pub mod proto {
    tonic::include_proto!("otterscale.tunnel");
}

/// Metadata key carrying the agent identity on the initial `OpenTunnel` call.
pub const META_AGENT_ID: &str = "x-agent-id";
/// Metadata key carrying the password derived from the agent's signed certificate.
pub const META_PASSWORD: &str = "x-agent-password";
/// Metadata key carrying the requested remote-forward spec, e.g. `R:127.4.9.201:16598:127.0.0.1:8443`.
pub const META_REMOTE_SPEC: &str = "x-remote-spec";

#[derive(thiserror::Error, Debug)]
pub enum TunnelAuthError {
    #[error("unknown agent identity")]
    UnknownUser,
    #[error("invalid auth")]
    InvalidAuth,
    #[error("remote forward spec does not match the constraint installed for this agent")]
    ConstraintMismatch,
}

/// Implemented by the hub-side listener so the transport crate never needs
/// to know about the registry or address pool.
///
/// Async because the authorized-user table is guarded by an async-aware
/// lock shared with registration/deregistration (see
/// `crate::listener::TunnelListener`): a blocking `try_read` here would
/// mistake lock contention for an unknown user.
#[tonic::async_trait]
pub trait TunnelAuthenticator: Send + Sync + 'static {
    async fn authenticate(
        &self,
        agent_id: &str,
        password: &str,
        remote_spec: &str,
    ) -> Result<(), TunnelAuthError>;
}
