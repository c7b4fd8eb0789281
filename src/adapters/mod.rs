use anyhow::Result;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::platform::Platform;

pub mod fs_store;
pub mod http;
pub mod kubectl;
pub mod simulated;

/// Collaborators for a real cluster.
pub fn live(config: &AppConfig) -> Result<Platform> {
    let kubectl = Arc::new(kubectl::Kubectl::new(
        &config.cluster,
        config.timeouts.capture().max(config.timeouts.restore()),
    ));
    let transfer = config.timeouts.transfer();
    let probe = config.timeouts.probe();

    Ok(Platform {
        cluster: kubectl.clone(),
        database: kubectl.clone(),
        cache: kubectl,
        vectors: Arc::new(http::VectorIndexClient::new(transfer)?),
        storage: Arc::new(fs_store::FsObjectStore::new(&config.storage.root)),
        dns: Arc::new(http::DnsClient::new(&config.failover.dns_api_url, probe)?),
        http: Arc::new(http::HttpHealth::new(probe)?),
    })
}

/// In-memory cluster seeded with every configured environment. Artifacts
/// still land in the configured storage root so separate runs share them.
pub fn simulated(config: &AppConfig) -> (Platform, simulated::SimulatedPlatform) {
    let sim = simulated::SimulatedPlatform::new();
    for env in &config.environments {
        sim.seed(env, &config.components);
    }
    if let Some(primary) = config.failover.sites.first() {
        sim.set_record(
            &config.failover.record_name,
            &primary.endpoint,
            config.failover.ttl_secs,
        );
    }
    let storage = Arc::new(fs_store::FsObjectStore::new(&config.storage.root));
    (sim.platform_with_storage(storage), sim)
}
