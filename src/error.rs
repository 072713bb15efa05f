//! The unified error enum for the cluster-routing tunnel core, classifying
//! into the kinds spec §7 requires callers to distinguish.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Boot-time PKI construction or missing required configuration. Fatal;
    /// the process should not start serving.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// CSR parse/verify failure, or a malformed cluster/agent identity.
    /// Surfaced to the registration caller directly; never retried.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The address pool has no free host left.
    #[error("address pool exhausted")]
    Exhausted,

    /// `resolve(cluster)` found no live entry.
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    /// The tunnel listener has not finished `start()` yet.
    #[error("listener not ready")]
    NotReady,

    /// The agent session loop classified a tunnel error as
    /// authentication-related; triggers immediate re-registration rather
    /// than backoff.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Any other I/O error from the tunnel; triggers jittered exponential
    /// backoff in the agent session loop.
    #[error("transient error: {0}")]
    Transient(String),
}

impl From<otterscale_pki::PkiError> for CoreError {
    fn from(err: otterscale_pki::PkiError) -> Self {
        use otterscale_pki::PkiError;
        match err {
            PkiError::PlaceholderSeed | PkiError::SeedTooShort(_) => {
                CoreError::ConfigError(err.to_string())
            }
            PkiError::MalformedCsr(_) | PkiError::InvalidCsrSignature => {
                CoreError::BadRequest(err.to_string())
            }
            PkiError::SeedExpansion(_) | PkiError::Generation(_) => {
                CoreError::ConfigError(err.to_string())
            }
        }
    }
}

impl From<CoreError> for tonic::Status {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConfigError(msg) => tonic::Status::internal(msg),
            CoreError::BadRequest(msg) => tonic::Status::invalid_argument(msg),
            CoreError::Exhausted => tonic::Status::resource_exhausted("address pool exhausted"),
            CoreError::ClusterNotFound(cluster) => {
                tonic::Status::not_found(format!("cluster not found: {cluster}"))
            }
            CoreError::NotReady => tonic::Status::unavailable("listener not ready"),
            CoreError::AuthFailed(msg) => tonic::Status::unauthenticated(msg),
            CoreError::Transient(msg) => tonic::Status::unavailable(msg),
        }
    }
}
