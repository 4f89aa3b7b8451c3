//! Crate-wide configuration container, constructed explicitly and passed
//! into `CacheOptimizer::new` — the design notes (§9) rule out an implicit
//! global here the same way they rule one out for the optimizer itself.

use std::path::PathBuf;
use std::time::Duration;

use crate::gateway::GatewayFlavor;
use crate::registry::EvictionPolicy;
use crate::swarm::SwarmCaps;

#[derive(Debug, Clone)]
pub struct DccConfig {
    pub cache_dir: PathBuf,
    pub swarm_caps: SwarmCaps,
    pub peer_discovery_timeout: Duration,
    pub registry_max_bytes: u64,
    pub eviction_policy: EvictionPolicy,
    pub gateway_base_url: Option<String>,
    pub gateway_flavor: GatewayFlavor,
    pub graceful_shutdown_budget: Duration,
}

impl Default for DccConfig {
    fn default() -> Self {
        DccConfig {
            cache_dir: crate::port::default_port_file_path()
                .parent()
                .map(Into::into)
                .unwrap_or_else(std::env::temp_dir),
            swarm_caps: SwarmCaps::default(),
            peer_discovery_timeout: Duration::from_secs(30),
            registry_max_bytes: 10 * 1024 * 1024 * 1024, // 10 GiB
            eviction_policy: EvictionPolicy::default(),
            gateway_base_url: None,
            gateway_flavor: GatewayFlavor::Relay,
            graceful_shutdown_budget: Duration::from_secs(30),
        }
    }
}

impl DccConfig {
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_swarm_caps(mut self, caps: SwarmCaps) -> Self {
        self.swarm_caps = caps;
        self
    }

    pub fn with_gateway(mut self, base_url: impl Into<String>, flavor: GatewayFlavor) -> Self {
        self.gateway_base_url = Some(base_url.into());
        self.gateway_flavor = flavor;
        self
    }

    pub fn registry_path(&self) -> PathBuf {
        self.cache_dir.join("registry.json")
    }

    pub fn descriptor_dir(&self) -> PathBuf {
        self.cache_dir.join("descriptors")
    }
}
