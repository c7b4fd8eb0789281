//! Pushes verified artifacts and manifests to durable off-site storage, and
//! pulls them back for restore.
//!
//! Keys are `<environment>/<manifest_id>/<file>`, so re-uploading a manifest
//! overwrites its own keys and never creates duplicates.

use anyhow::{Context, anyhow};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::manifest::{self, ArtifactRef, BackupManifest, MANIFEST_FILE};
use super::platform::{Metadata, ObjectStorage};
use super::retry::{RetryPolicy, retry};
use crate::error::{DrError, DrResult};

/// One manifest's worth of remote keys.
#[derive(Debug, Clone)]
pub struct RemoteManifest {
    pub environment: String,
    pub id: String,
    pub keys: Vec<String>,
    /// Parsed remote `manifest.json`, when present and readable.
    pub manifest: Option<BackupManifest>,
}

impl RemoteManifest {
    pub fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.manifest
            .as_ref()
            .map(|m| m.created_at)
            .or_else(|| manifest::created_at_of(&self.id))
    }

    pub fn is_complete(&self) -> bool {
        self.manifest
            .as_ref()
            .is_some_and(|m| m.status == manifest::ManifestStatus::Complete)
    }
}

#[derive(Clone)]
pub struct UploadTransport {
    storage: Arc<dyn ObjectStorage>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl UploadTransport {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            clock,
            policy,
            timeout,
        }
    }

    /// Upload every verified artifact of `manifest` that is not already remote.
    ///
    /// Each artifact gets its own retry budget. An exhausted artifact records
    /// `upload_error` and the remaining artifacts are still attempted; the
    /// first such failure is returned. Unverified artifacts are refused.
    pub async fn upload(&self, manifest: &mut BackupManifest) -> DrResult<()> {
        let mut first_failure = None;
        let metadata = self.metadata(manifest);

        for component in manifest.components.clone() {
            let Some(artifact) = manifest.artifacts.get_mut(&component) else {
                continue;
            };
            if !artifact.verified {
                return Err(DrError::Verification {
                    component,
                    message: "artifact is not verified; refusing to upload".into(),
                });
            }
            if artifact.is_uploaded() {
                debug!(component = %component, "Artifact already uploaded, skipping");
                continue;
            }

            let key = manifest::remote_key(&manifest.environment, &manifest.id, &artifact.file_name());
            let mut meta = metadata.clone();
            meta.insert("component".into(), component.clone());
            meta.insert("checksum".into(), artifact.checksum.clone());

            match self.put_artifact(&key, artifact, meta).await {
                Ok(uri) => {
                    info!(component = %component, uri = %uri, "Artifact uploaded");
                    artifact.remote_uri = Some(uri);
                    artifact.upload_error = None;
                }
                Err((attempts, message)) => {
                    error!(
                        manifest_id = %manifest.id,
                        component = %component,
                        phase = "uploading",
                        attempts,
                        error = %message,
                        "Upload failed"
                    );
                    artifact.upload_error = Some(message.clone());
                    first_failure.get_or_insert(DrError::Transport {
                        component,
                        attempts,
                        message,
                    });
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn put_artifact(
        &self,
        key: &str,
        artifact: &ArtifactRef,
        metadata: Metadata,
    ) -> Result<String, (u32, String)> {
        let label = format!("upload {}", artifact.component);
        let path = artifact.local_path.clone();
        retry(self.clock.as_ref(), &self.policy, &label, |_| {
            let path = path.clone();
            let metadata = metadata.clone();
            self.bounded(async move { self.storage.put_file(key, &path, metadata).await })
        })
        .await
        .map_err(|e| (e.attempts, format!("{:#}", e.last_error)))
    }

    /// Mirror the manifest document next to its artifacts.
    pub async fn publish_manifest(&self, manifest: &BackupManifest) -> DrResult<String> {
        let key = manifest::remote_key(&manifest.environment, &manifest.id, MANIFEST_FILE);
        let body = serde_json::to_vec_pretty(manifest).map_err(anyhow::Error::from)?;
        let metadata = self.metadata(manifest);

        retry(self.clock.as_ref(), &self.policy, "publish manifest", |_| {
            let body = body.clone();
            let metadata = metadata.clone();
            let key = key.clone();
            self.bounded(async move { self.storage.put(&key, body, metadata).await })
        })
        .await
        .map_err(|e| DrError::Transport {
            component: MANIFEST_FILE.to_string(),
            attempts: e.attempts,
            message: format!("{:#}", e.last_error),
        })
    }

    pub async fn fetch_manifest(&self, environment: &str, id: &str) -> DrResult<BackupManifest> {
        let prefix = manifest::remote_prefix(environment, id);
        let key = manifest::remote_key(environment, id, MANIFEST_FILE);

        let listed = self
            .bounded(self.storage.list(&prefix))
            .await
            .map_err(|e| DrError::Prerequisite(format!("remote storage unreachable: {e:#}")))?;
        if !listed.iter().any(|o| o.key == key) {
            return Err(DrError::NotFound(format!("manifest {id}")));
        }

        let body = retry(self.clock.as_ref(), &self.policy, "fetch manifest", |_| {
            self.bounded(self.storage.get(&key))
        })
        .await
        .map_err(|e| anyhow!("Failed to download {key}: {:#}", e.last_error))?;

        let manifest = serde_json::from_slice(&body)
            .with_context(|| format!("Failed to parse remote manifest {key}"))?;
        Ok(manifest)
    }

    /// Download an artifact's remote copy into `dest_dir`, returning the local path.
    pub async fn download(
        &self,
        manifest: &BackupManifest,
        artifact: &ArtifactRef,
        dest_dir: &Path,
    ) -> DrResult<PathBuf> {
        let key = manifest::remote_key(&manifest.environment, &manifest.id, &artifact.file_name());
        let dest = dest_dir.join(artifact.file_name());
        let label = format!("download {}", artifact.component);

        let size = retry(self.clock.as_ref(), &self.policy, &label, |_| {
            let dest = dest.clone();
            let key = key.clone();
            self.bounded(async move { self.storage.get_to_file(&key, &dest).await })
        })
        .await
        .map_err(|e| DrError::Transport {
            component: artifact.component.clone(),
            attempts: e.attempts,
            message: format!("{:#}", e.last_error),
        })?;

        debug!(component = %artifact.component, bytes = size, "Artifact downloaded");
        Ok(dest)
    }

    /// Every manifest present remotely for `environment`, grouped by id.
    pub async fn list_remote(&self, environment: &str) -> DrResult<Vec<RemoteManifest>> {
        let prefix = format!("{environment}/");
        let objects = self
            .bounded(self.storage.list(&prefix))
            .await
            .map_err(|e| DrError::Prerequisite(format!("remote storage unreachable: {e:#}")))?;

        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for object in objects {
            let Some(rest) = object.key.strip_prefix(&prefix) else {
                continue;
            };
            let Some((id, _file)) = rest.split_once('/') else {
                continue;
            };
            grouped.entry(id.to_string()).or_default().push(object.key);
        }

        let mut remote = Vec::with_capacity(grouped.len());
        for (id, keys) in grouped {
            let manifest_key = manifest::remote_key(environment, &id, MANIFEST_FILE);
            let manifest = if keys.contains(&manifest_key) {
                match self.bounded(self.storage.get(&manifest_key)).await {
                    Ok(body) => serde_json::from_slice(&body).ok(),
                    Err(e) => {
                        warn!(manifest_id = %id, error = %e, "Failed to read remote manifest");
                        None
                    }
                }
            } else {
                None
            };
            remote.push(RemoteManifest {
                environment: environment.to_string(),
                id,
                keys,
                manifest,
            });
        }
        Ok(remote)
    }

    pub async fn delete_keys(&self, keys: &[String]) -> anyhow::Result<()> {
        for key in keys {
            self.bounded(self.storage.delete(key))
                .await
                .with_context(|| format!("Failed to delete remote key {key}"))?;
        }
        Ok(())
    }

    pub async fn ping(&self) -> DrResult<()> {
        self.bounded(self.storage.ping())
            .await
            .map_err(|e| DrError::Prerequisite(format!("remote storage unreachable: {e:#}")))
    }

    fn metadata(&self, manifest: &BackupManifest) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("environment".into(), manifest.environment.clone());
        meta.insert("manifest-id".into(), manifest.id.clone());
        meta.insert("mode".into(), manifest.mode.as_str().into());
        meta.insert("created-at".into(), manifest.created_at.to_rfc3339());
        meta
    }

    async fn bounded<T, F>(&self, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| anyhow!("timed out after {}s", self.timeout.as_secs()))?
    }
}
