//! Pruning of expired manifests, locally and remotely.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::clock::Clock;
use super::manifest::{ManifestStatus, ManifestStore};
use super::transport::UploadTransport;
use crate::error::DrResult;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub environment: String,
    pub cutoff: Option<DateTime<Utc>>,
    /// Newest complete manifest, kept regardless of age.
    pub protected: Option<String>,
    pub deleted_local: Vec<String>,
    pub deleted_remote: Vec<String>,
    /// Deletions that failed. Non-empty means the prune did not finish cleanly.
    pub errors: Vec<String>,
}

impl PruneReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Clone)]
pub struct RetentionManager {
    store: ManifestStore,
    transport: UploadTransport,
    clock: Arc<dyn Clock>,
}

impl RetentionManager {
    pub fn new(store: ManifestStore, transport: UploadTransport, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            transport,
            clock,
        }
    }

    /// Delete manifests created before `now - retention_days` from both stores.
    ///
    /// The newest complete manifest for the environment, across local and
    /// remote, is never deleted. The caller must hold the environment lock.
    pub async fn prune(&self, environment: &str, retention_days: u32) -> DrResult<PruneReport> {
        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(retention_days));
        let mut report = PruneReport {
            environment: environment.to_string(),
            cutoff: Some(cutoff),
            ..Default::default()
        };

        let local = self.store.list(environment).await?;
        let remote = self.transport.list_remote(environment).await?;

        let protected = local
            .iter()
            .filter(|m| m.status == ManifestStatus::Complete)
            .map(|m| (m.created_at, m.id.clone()))
            .chain(
                remote
                    .iter()
                    .filter(|r| r.is_complete())
                    .filter_map(|r| r.created_at().map(|at| (at, r.id.clone()))),
            )
            .max();
        report.protected = protected.map(|(_, id)| id);

        info!(
            environment,
            cutoff = %cutoff.to_rfc3339(),
            protected = report.protected.as_deref().unwrap_or("none"),
            local = local.len(),
            remote = remote.len(),
            "Pruning expired manifests"
        );

        let is_protected = |id: &str| report.protected.as_deref() == Some(id);

        let mut local_deletes = Vec::new();
        for manifest in &local {
            if manifest.created_at < cutoff && !is_protected(&manifest.id) {
                local_deletes.push(manifest.id.clone());
            }
        }

        let mut remote_deletes = Vec::new();
        for entry in &remote {
            match entry.created_at() {
                Some(at) if at < cutoff && !is_protected(&entry.id) => remote_deletes.push(entry),
                Some(_) => {}
                None => {
                    warn!(environment, key_prefix = %entry.id, "Remote entry has no readable timestamp, leaving it")
                }
            }
        }

        for id in local_deletes {
            match self.store.delete(environment, &id).await {
                Ok(()) => {
                    info!(environment, manifest_id = %id, "Deleted local manifest");
                    report.deleted_local.push(id);
                }
                Err(e) => {
                    error!(environment, manifest_id = %id, phase = "prune", error = %e, "Local delete failed");
                    report.errors.push(format!("local {id}: {e}"));
                }
            }
        }

        for entry in remote_deletes {
            match self.transport.delete_keys(&entry.keys).await {
                Ok(()) => {
                    info!(environment, manifest_id = %entry.id, keys = entry.keys.len(), "Deleted remote manifest");
                    report.deleted_remote.push(entry.id.clone());
                }
                Err(e) => {
                    error!(environment, manifest_id = %entry.id, phase = "prune", error = %e, "Remote delete failed");
                    report.errors.push(format!("remote {}: {:#}", entry.id, e));
                }
            }
        }

        Ok(report)
    }
}
