use std::net::SocketAddr;
use std::path::PathBuf;

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Process-wide configuration, loaded once at boot from defaults merged
/// with `OTTERSCALE_`-prefixed environment variables, mirroring the
/// teacher's `EnvConfig::load()`.
///
/// `secrecy::SecretString` deliberately implements `Deserialize` but not
/// `Serialize` (so a config struct can never be accidentally logged with its
/// secrets intact); [`EnvConfig`] gets a hand-written `Serialize` below
/// instead of the usual derive, purely so `Serialized::defaults` can seed
/// figment with this struct's compiled-in defaults before the environment
/// merge overwrites them.
#[derive(Deserialize, Debug)]
pub struct EnvConfig {
    /// Bind address for the tunnel gRPC listener (component 4). Agents dial
    /// this address to open their reverse tunnel.
    pub tunnel_address: SocketAddr,

    /// Hostname/SANs the listener's server certificate is generated for.
    pub tunnel_hostname: String,

    /// The hub's cluster-routing tunnel CA seed. Must not equal the
    /// documented placeholder; enforced by `otterscale_pki::CertificateAuthority`.
    pub tunnel_key_seed: SecretString,

    /// The user-facing ConnectRPC/HTTP surface's own bind address (out of
    /// scope for the core; carried so `server` mode has somewhere to listen).
    pub server_url: SocketAddr,

    /// The hub tunnel listener's externally reachable URL, dialed by agents.
    pub tunnel_server_url: String,

    /// Bind address for the registration RPC (spec §4.4). Kept on its own
    /// port because, unlike the tunnel listener, it must accept
    /// connections from agents that do not yet hold a client certificate.
    pub registration_address: SocketAddr,

    /// The registration RPC's externally reachable URL, dialed by agents
    /// before they hold any tunnel credentials.
    pub registration_server_url: String,

    /// Agent mode only: a CA bundle trusted for the initial registration
    /// dial, supplied out-of-band (e.g. baked into the installation
    /// manifest, out of this core's scope). When absent, the platform's
    /// native root store is trusted instead, for deployments that front
    /// the registration endpoint with a publicly-trusted ingress.
    pub agent_bootstrap_ca_path: Option<PathBuf>,

    /// Agent mode only: the cluster name this agent registers as.
    pub cluster: Option<String>,

    /// Agent mode only: the local port of the in-cluster Kubernetes API
    /// proxy this agent forwards traffic to.
    pub local_port: u16,

    /// Agent mode only: this agent binary's own version string, reported at
    /// registration time.
    pub agent_version: String,

    /// The single TCP port all allocated cluster endpoints share.
    pub shared_port: u16,

    /// Health check probe cadence, in seconds.
    pub health_check_interval_secs: u64,

    /// Per-probe TCP dial timeout, in seconds.
    pub health_check_timeout_secs: u64,

    /// Consecutive probe failures before a cluster is deregistered.
    pub health_check_fail_threshold: u32,

    /// Per-listener graceful shutdown budget, in seconds.
    pub shutdown_timeout_secs: u64,

    /// Agent session loop's backoff bounds, in milliseconds.
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Serialize for EnvConfig {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("EnvConfig", 18)?;
        state.serialize_field("tunnel_address", &self.tunnel_address)?;
        state.serialize_field("tunnel_hostname", &self.tunnel_hostname)?;
        state.serialize_field("tunnel_key_seed", self.tunnel_key_seed.expose_secret())?;
        state.serialize_field("server_url", &self.server_url)?;
        state.serialize_field("tunnel_server_url", &self.tunnel_server_url)?;
        state.serialize_field("registration_address", &self.registration_address)?;
        state.serialize_field("registration_server_url", &self.registration_server_url)?;
        state.serialize_field("agent_bootstrap_ca_path", &self.agent_bootstrap_ca_path)?;
        state.serialize_field("cluster", &self.cluster)?;
        state.serialize_field("local_port", &self.local_port)?;
        state.serialize_field("agent_version", &self.agent_version)?;
        state.serialize_field("shared_port", &self.shared_port)?;
        state.serialize_field("health_check_interval_secs", &self.health_check_interval_secs)?;
        state.serialize_field("health_check_timeout_secs", &self.health_check_timeout_secs)?;
        state.serialize_field("health_check_fail_threshold", &self.health_check_fail_threshold)?;
        state.serialize_field("shutdown_timeout_secs", &self.shutdown_timeout_secs)?;
        state.serialize_field("backoff_base_ms", &self.backoff_base_ms)?;
        state.serialize_field("backoff_max_ms", &self.backoff_max_ms)?;
        state.end()
    }
}

impl EnvConfig {
    pub fn load() -> anyhow::Result<Self> {
        Ok(Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("OTTERSCALE_"))
            .merge(Env::prefixed("OTTERSCALE_SERVER_"))
            .extract()?)
    }

    pub fn health_check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.health_check_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            tunnel_address: "0.0.0.0:7900".parse().unwrap(),
            tunnel_hostname: "otterscale-hub".to_string(),
            tunnel_key_seed: SecretString::from(otterscale_pki::PLACEHOLDER_SEED.to_string()),
            server_url: "0.0.0.0:8443".parse().unwrap(),
            tunnel_server_url: "https://otterscale-hub:7900".to_string(),
            registration_address: "0.0.0.0:7901".parse().unwrap(),
            registration_server_url: "https://otterscale-hub:7901".to_string(),
            agent_bootstrap_ca_path: None,
            cluster: None,
            local_port: 6443,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            shared_port: 16598,
            health_check_interval_secs: 15,
            health_check_timeout_secs: 2,
            health_check_fail_threshold: 3,
            shutdown_timeout_secs: 15,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}
