//! Address allocator and tunnel registry (spec §4.2).
//!
//! A single `tokio::sync::RwLock` guards the pool bitmap and the
//! cluster→entry map together, mirroring the way the teacher keeps related
//! pieces of `AuthlyState` behind one async-aware lock rather than letting
//! two locks drift out of sync. Registration and deregistration hold the
//! write lock across the compound operation (evict old → release old →
//! allocate new → authorize new → install entry), including the `.await`
//! into the listener, so that `resolve()` never observes a host with no
//! matching listener user.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::error::CoreError;
use crate::listener::TunnelListener;

/// Lower/upper bound (inclusive) each octet of an allocated host is drawn
/// from. `0` and `255` are reserved, matching spec §8's boundary behavior.
const OCTET_MIN: u32 = 1;
const OCTET_MAX: u32 = 254;
const OCTET_RANGE: u32 = OCTET_MAX - OCTET_MIN + 1;

/// `127.a.b.c` for `a, b, c` in `1..=254`: ≈1.6×10^7 addresses.
pub const FULL_POOL_SIZE: usize = (OCTET_RANGE * OCTET_RANGE * OCTET_RANGE) as usize;

fn host_from_index(index: usize) -> Ipv4Addr {
    let i = index as u32;
    let a = OCTET_MIN + (i / (OCTET_RANGE * OCTET_RANGE)) % OCTET_RANGE;
    let b = OCTET_MIN + (i / OCTET_RANGE) % OCTET_RANGE;
    let c = OCTET_MIN + i % OCTET_RANGE;
    Ipv4Addr::new(127, a as u8, b as u8, c as u8)
}

fn hash_name(name: &str) -> usize {
    let digest = blake3::hash(name.as_bytes());
    u64::from_le_bytes(digest.as_bytes()[0..8].try_into().unwrap()) as usize
}

/// The free/used bitmap over `{127.a.b.c}`. `capacity` restricts the space
/// actually in play (the full range in production, a small number in
/// tests) without changing the allocation algorithm.
struct AddressPool {
    capacity: usize,
    used: HashSet<Ipv4Addr>,
}

impl AddressPool {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.min(FULL_POOL_SIZE).max(1),
            used: HashSet::new(),
        }
    }

    /// Hash-biased linear probe: start at `hash(name) mod capacity`, probe
    /// forward until an unused host is found. Correctness never depends on
    /// the starting point, only on probing the whole space before giving up.
    fn allocate(&mut self, cluster_name: &str) -> Result<Ipv4Addr, CoreError> {
        if self.used.len() >= self.capacity {
            return Err(CoreError::Exhausted);
        }

        let start = hash_name(cluster_name) % self.capacity;
        for k in 0..self.capacity {
            let host = host_from_index((start + k) % self.capacity);
            if !self.used.contains(&host) {
                self.used.insert(host);
                return Ok(host);
            }
        }
        Err(CoreError::Exhausted)
    }

    fn release(&mut self, host: Ipv4Addr) {
        self.used.remove(&host);
    }
}

/// The per-cluster tunnel state (spec §3).
#[derive(Clone, Debug)]
pub struct ClusterEntry {
    pub cluster_name: String,
    pub allocated_host: Ipv4Addr,
    pub agent_identity: String,
    pub agent_version: String,
}

struct RegistryState {
    pool: AddressPool,
    clusters: HashMap<String, ClusterEntry>,
}

/// Owns the address pool and the cluster→entry map; holds a handle to the
/// tunnel listener so that registration/deregistration can keep the
/// listener's user table in lockstep under the same write lock.
pub struct TunnelRegistry {
    shared_port: u16,
    state: RwLock<RegistryState>,
    listener: Arc<TunnelListener>,
}

impl TunnelRegistry {
    pub fn new(shared_port: u16, pool_capacity: usize, listener: Arc<TunnelListener>) -> Self {
        Self {
            shared_port,
            state: RwLock::new(RegistryState {
                pool: AddressPool::new(pool_capacity),
                clusters: HashMap::new(),
            }),
            listener,
        }
    }

    pub fn full_capacity(shared_port: u16, listener: Arc<TunnelListener>) -> Self {
        Self::new(shared_port, FULL_POOL_SIZE, listener)
    }

    /// Install `entry`, evicting and releasing any prior allocation for the
    /// same cluster first. Re-registration always wins; no `Conflict` is
    /// ever raised (spec §4.4).
    pub async fn register(
        &self,
        cluster: &str,
        agent_identity: &str,
        agent_version: &str,
        password: &str,
    ) -> Result<Ipv4Addr, CoreError> {
        let mut state = self.state.write().await;

        if let Some(prior) = state.clusters.remove(cluster) {
            self.listener.delete_user(&prior.agent_identity).await;
            state.pool.release(prior.allocated_host);
            info!(cluster, prior_host = %prior.allocated_host, "evicted prior registration");
        }

        let host = state.pool.allocate(cluster)?;
        let constraint = endpoint_constraint(host, self.shared_port);

        if let Err(err) = self
            .listener
            .add_user(agent_identity.to_string(), password.to_string(), constraint)
            .await
        {
            // Roll back the allocation so a listener failure never leaks a host.
            state.pool.release(host);
            return Err(err);
        }

        state.clusters.insert(
            cluster.to_string(),
            ClusterEntry {
                cluster_name: cluster.to_string(),
                allocated_host: host,
                agent_identity: agent_identity.to_string(),
                agent_version: agent_version.to_string(),
            },
        );

        Ok(host)
    }

    /// No-op if `cluster` is absent.
    pub async fn deregister(&self, cluster: &str) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.clusters.remove(cluster) {
            self.listener.delete_user(&entry.agent_identity).await;
            state.pool.release(entry.allocated_host);
            info!(cluster, host = %entry.allocated_host, "deregistered cluster");
        }
    }

    pub async fn resolve(&self, cluster: &str) -> Result<String, CoreError> {
        let state = self.state.read().await;
        match state.clusters.get(cluster) {
            Some(entry) => Ok(format!("http://{}:{}", entry.allocated_host, self.shared_port)),
            None => Err(CoreError::ClusterNotFound(cluster.to_string())),
        }
    }

    /// Copy-out for iteration (the health checker) without holding the lock
    /// across I/O.
    pub async fn snapshot(&self) -> HashMap<String, Ipv4Addr> {
        let state = self.state.read().await;
        state
            .clusters
            .iter()
            .map(|(cluster, entry)| (cluster.clone(), entry.allocated_host))
            .collect()
    }

    pub fn shared_port(&self) -> u16 {
        self.shared_port
    }
}

/// Implemented by the (out-of-scope) user-facing HTTP/RPC handler so it
/// never needs a concrete `TunnelRegistry` reference, just the lookup.
#[tonic::async_trait]
pub trait ClusterRouter: Send + Sync {
    async fn resolve(&self, cluster: &str) -> Result<String, CoreError>;
}

#[tonic::async_trait]
impl ClusterRouter for TunnelRegistry {
    async fn resolve(&self, cluster: &str) -> Result<String, CoreError> {
        TunnelRegistry::resolve(self, cluster).await
    }
}

/// `^R:<host>:<port>(:.*)?$`, anchored so a user can forward exactly one
/// endpoint.
pub fn endpoint_constraint(host: Ipv4Addr, port: u16) -> String {
    format!("^R:{}:{}(:.*)?$", regex::escape(&host.to_string()), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry(capacity: usize) -> TunnelRegistry {
        TunnelRegistry::new(16598, capacity, Arc::new(TunnelListener::for_tests()))
    }

    #[test]
    fn host_from_index_never_hits_reserved_octets() {
        for idx in [0usize, 1, FULL_POOL_SIZE / 2, FULL_POOL_SIZE - 1] {
            let host = host_from_index(idx);
            let octets = host.octets();
            assert_eq!(octets[0], 127);
            for octet in &octets[1..] {
                assert!((1..=254).contains(octet), "{host} has a reserved octet");
            }
        }
    }

    #[tokio::test]
    async fn two_clusters_get_distinct_hosts() {
        let registry = test_registry(16);
        let host_a = registry
            .register("cluster-a", "agent-a", "1.0.0", "pw-a")
            .await
            .unwrap();
        let host_b = registry
            .register("cluster-b", "agent-b", "1.0.0", "pw-b")
            .await
            .unwrap();
        assert_ne!(host_a, host_b);
        assert_eq!(
            registry.resolve("cluster-a").await.unwrap(),
            format!("http://{host_a}:16598")
        );
        assert_eq!(
            registry.resolve("cluster-b").await.unwrap(),
            format!("http://{host_b}:16598")
        );
    }

    #[tokio::test]
    async fn reregistration_newest_wins() {
        let registry = test_registry(16);
        registry
            .register("cluster-r", "agent-r-1", "1.0.0", "pw-1")
            .await
            .unwrap();
        let host_2 = registry
            .register("cluster-r", "agent-r-2", "1.0.0", "pw-2")
            .await
            .unwrap();

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            registry.resolve("cluster-r").await.unwrap(),
            format!("http://{host_2}:16598")
        );
    }

    #[tokio::test]
    async fn exhaustion_then_release_recovers() {
        let registry = test_registry(16);
        for i in 0..16 {
            registry
                .register(&format!("cluster-{i}"), &format!("agent-{i}"), "1.0.0", "pw")
                .await
                .unwrap();
        }

        let err = registry
            .register("cluster-overflow", "agent-overflow", "1.0.0", "pw")
            .await;
        assert!(matches!(err, Err(CoreError::Exhausted)));

        registry.deregister("cluster-0").await;

        registry
            .register("cluster-overflow", "agent-overflow", "1.0.0", "pw")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resolve_missing_cluster_is_not_found() {
        let registry = test_registry(16);
        let err = registry.resolve("nope").await;
        assert!(matches!(err, Err(CoreError::ClusterNotFound(_))));
    }

    #[test]
    fn endpoint_constraint_matches_spec_shape() {
        let host: Ipv4Addr = "127.4.9.201".parse().unwrap();
        let re = regex::Regex::new(&endpoint_constraint(host, 16598)).unwrap();
        assert!(re.is_match("R:127.4.9.201:16598"));
        assert!(re.is_match("R:127.4.9.201:16598:127.0.0.1:8443"));
        assert!(!re.is_match("R:127.0.0.1:16598"));
        assert!(!re.is_match("R:127.4.9.201:9999"));
        assert!(!re.is_match("xR:127.4.9.201:16598"));
    }
}
