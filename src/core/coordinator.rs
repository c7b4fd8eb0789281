//! Backup path: capture, verify, upload, publish, prune.

use anyhow::anyhow;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::artifact;
use super::components::ComponentHandler;
use super::crypto::Encryptor;
use super::manifest::{ArtifactRef, BackupManifest, BackupMode, MANIFEST_FILE, ManifestStatus};
use super::notifications::DrEvent;
use super::registry::{ComponentDescriptor, group_by_rank};
use super::retention::PruneReport;
use super::transport::UploadTransport;
use crate::config::EnvironmentConfig;
use crate::context::AppContext;
use crate::error::{DrError, DrResult};

const STAGING_DIR: &str = ".staging";

/// Result of a full backup run.
#[derive(Debug)]
pub struct BackupRun {
    pub manifest: BackupManifest,
    /// Present when the manifest completed and retention ran afterwards.
    pub prune: Option<PruneReport>,
}

impl BackupRun {
    /// 0 for a complete manifest, 1 for one that failed part way.
    pub fn exit_code(&self) -> u8 {
        if self.manifest.status == ManifestStatus::Complete {
            0
        } else {
            1
        }
    }
}

pub struct BackupCoordinator {
    ctx: AppContext,
}

impl BackupCoordinator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Capture, verify, and upload, then prune and notify.
    ///
    /// `Err` means nothing was attempted (bad input, busy environment, missing
    /// prerequisite). A manifest that ran and failed comes back as `Ok` with
    /// `status == Failed`.
    pub async fn run(&self, environment: &str, mode: BackupMode) -> DrResult<BackupRun> {
        let span = info_span!("backup", environment, mode = mode.as_str());
        async {
            let _guard = self.ctx.locks.acquire(environment, "backup")?;
            let manifest = self.capture_locked(environment, mode).await?;

            let prune = if manifest.status == ManifestStatus::Complete {
                match self
                    .ctx
                    .retention()
                    .prune(environment, self.ctx.config.retention_days)
                    .await
                {
                    Ok(report) => Some(report),
                    Err(e) => {
                        error!(environment, phase = "prune", error = %e, "Retention failed after backup");
                        None
                    }
                }
            } else {
                None
            };

            self.ctx.notifier.notify(backup_event(&manifest)).await;
            Ok::<_, DrError>(BackupRun { manifest, prune })
        }
        .instrument(span)
        .await
    }

    /// Produce a manifest for `environment` under the environment lock.
    pub async fn capture_all(
        &self,
        environment: &str,
        mode: BackupMode,
    ) -> DrResult<BackupManifest> {
        let _guard = self.ctx.locks.acquire(environment, "backup")?;
        self.capture_locked(environment, mode).await
    }

    async fn capture_locked(&self, environment: &str, mode: BackupMode) -> DrResult<BackupManifest> {
        let config = &self.ctx.config;
        let target = config.environment(environment)?.clone();

        let selected: Vec<ComponentDescriptor> = self
            .ctx
            .registry
            .all()
            .iter()
            .filter(|c| mode.includes(c.kind()))
            .map(|c| c.resolve(&target))
            .collect();
        if selected.is_empty() {
            return Err(DrError::Config(format!(
                "no registered component is selected by mode '{mode}'"
            )));
        }

        let encryptor = self.encryptor()?;
        self.check_prerequisites(&target).await?;

        let mut manifest = self.open_manifest(environment, mode, &selected).await?;
        let dir = self.ctx.store.manifest_dir(environment, &manifest.id);
        info!(
            environment,
            manifest_id = %manifest.id,
            components = manifest.components.len(),
            "Backup started"
        );

        let carried: HashSet<String> = manifest.artifacts.keys().cloned().collect();
        let captured = self
            .capture_ranks(&mut manifest, &selected, &target, &dir, encryptor.as_ref())
            .await;
        if let Err(e) = captured {
            self.discard_artifacts(&mut manifest, &dir, &carried).await;
            return self.finish_failed(manifest, e).await;
        }

        manifest.status = ManifestStatus::Verifying;
        self.ctx.store.save(&manifest).await?;
        let verifier = self.ctx.verifier();
        for component in manifest.components.clone() {
            let Some(artifact) = manifest.artifacts.get_mut(&component) else {
                let e = DrError::Internal(anyhow!("no artifact captured for '{component}'"));
                return self.finish_failed(manifest, e).await;
            };
            if artifact.verified {
                debug!(component = %component, "Artifact verified by an earlier run");
                continue;
            }
            let verified = verifier.verify(artifact).await;
            if let Err(e) = verified {
                return self.finish_failed(manifest, e).await;
            }
            self.ctx.store.save(&manifest).await?;
        }

        manifest.status = ManifestStatus::Uploading;
        self.ctx.store.save(&manifest).await?;
        let transport = self.ctx.transport();
        let uploaded = transport.upload(&mut manifest).await;
        self.ctx.store.save(&manifest).await?;
        if let Err(e) = uploaded {
            return self.finish_failed(manifest, e).await;
        }

        let manifest = self.publish(manifest, &transport).await?;
        if manifest.status != ManifestStatus::Complete {
            return Ok(manifest);
        }
        self.ctx.store.save(&manifest).await?;
        remove_dir_quietly(&dir.join(STAGING_DIR)).await;

        info!(
            environment,
            manifest_id = %manifest.id,
            total_bytes = total_bytes(&manifest),
            "Backup complete"
        );
        Ok(manifest)
    }

    fn encryptor(&self) -> DrResult<Option<Encryptor>> {
        if !self.ctx.config.encryption.enabled {
            return Ok(None);
        }
        match &self.ctx.encryptor {
            Some(e) => Ok(Some(e.clone())),
            None => Err(DrError::Prerequisite(
                "encryption is enabled but no passphrase is loaded".into(),
            )),
        }
    }

    async fn check_prerequisites(&self, target: &EnvironmentConfig) -> DrResult<()> {
        let timeout = self.ctx.config.timeouts.probe();
        match tokio::time::timeout(timeout, self.ctx.platform.cluster.ping(&target.namespace)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(DrError::Prerequisite(format!(
                    "cluster namespace '{}' unreachable: {e:#}",
                    target.namespace
                )));
            }
            Err(_) => {
                return Err(DrError::Prerequisite(format!(
                    "cluster namespace '{}' did not answer within {}s",
                    target.namespace,
                    timeout.as_secs()
                )));
            }
        }
        self.ctx.transport().ping().await
    }

    /// Resume an interrupted manifest for the same selection, or start a new one.
    async fn open_manifest(
        &self,
        environment: &str,
        mode: BackupMode,
        selected: &[ComponentDescriptor],
    ) -> DrResult<BackupManifest> {
        let names: Vec<String> = selected.iter().map(|c| c.name.clone()).collect();

        if let Some(mut previous) = self.ctx.store.resumable(environment, mode).await? {
            if previous.components == names {
                let before = previous.artifacts.len();
                previous
                    .artifacts
                    .retain(|_, a| a.verified && a.local_path.exists());
                previous.status = ManifestStatus::Capturing;
                self.ctx.store.save(&previous).await?;
                info!(
                    environment,
                    manifest_id = %previous.id,
                    kept = previous.artifacts.len(),
                    dropped = before - previous.artifacts.len(),
                    "Resuming interrupted backup"
                );
                return Ok(previous);
            }
            warn!(
                environment,
                manifest_id = %previous.id,
                "Interrupted backup has a different component set, starting fresh"
            );
        }

        let mut manifest = BackupManifest::new(
            environment,
            mode,
            names,
            self.ctx.clock.now(),
            self.ctx.config.retention_days,
        );
        self.ctx.store.allocate(&mut manifest).await?;
        self.ctx.store.save(&manifest).await?;
        Ok(manifest)
    }

    /// Capture rank by rank. Components within a rank run concurrently and
    /// every task in the rank is awaited before a failure is reported.
    async fn capture_ranks(
        &self,
        manifest: &mut BackupManifest,
        selected: &[ComponentDescriptor],
        target: &EnvironmentConfig,
        dir: &Path,
        encryptor: Option<&Encryptor>,
    ) -> DrResult<()> {
        let staging_root = dir.join(STAGING_DIR);

        for (rank, components) in group_by_rank(selected.iter()) {
            let pending: Vec<&ComponentDescriptor> = components
                .into_iter()
                .filter(|c| !manifest.artifacts.contains_key(&c.name))
                .collect();
            if pending.is_empty() {
                continue;
            }
            debug!(rank, components = pending.len(), "Capturing rank");

            let mut tasks = JoinSet::new();
            for component in pending {
                let job = CaptureJob {
                    handler: self.ctx.handler.clone(),
                    component: component.clone(),
                    target: target.clone(),
                    staging: staging_root.join(&component.name),
                    out_dir: dir.to_path_buf(),
                    encryptor: encryptor.cloned(),
                    timeout: self.ctx.config.timeouts.capture(),
                };
                let span = info_span!("capture", component = %component.name, rank);
                tasks.spawn(job.run().instrument(span));
            }

            let mut failures = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(artifact)) => {
                        info!(
                            component = %artifact.component,
                            size_bytes = artifact.size_bytes,
                            "Component captured"
                        );
                        manifest.artifacts.insert(artifact.component.clone(), artifact);
                    }
                    Ok(Err((component, message))) => {
                        error!(
                            manifest_id = %manifest.id,
                            component = %component,
                            phase = "capturing",
                            error = %message,
                            "Capture failed"
                        );
                        failures.push((component, message));
                    }
                    Err(e) => failures.push(("unknown".into(), format!("capture task failed: {e}"))),
                }
            }

            if !failures.is_empty() {
                failures.sort();
                let (component, message) = failures.remove(0);
                let message = if failures.is_empty() {
                    message
                } else {
                    let others: Vec<&str> = failures.iter().map(|(c, _)| c.as_str()).collect();
                    format!("{message} (also failed: {})", others.join(", "))
                };
                return Err(DrError::Capture { component, message });
            }

            self.ctx.store.save(manifest).await?;
        }

        Ok(())
    }

    /// Mark the manifest complete and publish it remotely. Either step
    /// failing leaves the manifest failed in the uploading phase.
    async fn publish(
        &self,
        mut manifest: BackupManifest,
        transport: &UploadTransport,
    ) -> DrResult<BackupManifest> {
        if let Err(e) = manifest.mark_complete(self.ctx.clock.now()) {
            return self.finish_failed(manifest, e).await;
        }
        if let Err(e) = transport.publish_manifest(&manifest).await {
            manifest.status = ManifestStatus::Uploading;
            manifest.completed_at = None;
            return self.finish_failed(manifest, e).await;
        }
        Ok(manifest)
    }

    /// Remove everything this run wrote except the manifest document.
    /// Artifacts in `carried` were verified by an earlier run and are kept.
    async fn discard_artifacts(
        &self,
        manifest: &mut BackupManifest,
        dir: &Path,
        carried: &HashSet<String>,
    ) {
        manifest.artifacts.retain(|name, _| carried.contains(name));
        let kept: HashSet<PathBuf> = manifest
            .artifacts
            .values()
            .map(|a| a.local_path.clone())
            .collect();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Cannot list manifest directory for cleanup");
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if entry.file_name() == MANIFEST_FILE || kept.contains(&path) {
                continue;
            }
            let removed = if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match removed {
                Ok(()) => debug!(path = %path.display(), "Removed partial artifact"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial artifact"),
            }
        }
    }

    async fn finish_failed(&self, mut manifest: BackupManifest, e: DrError) -> DrResult<BackupManifest> {
        let phase = manifest.status.as_str();
        error!(
            environment = %manifest.environment,
            manifest_id = %manifest.id,
            phase,
            component = e.component().unwrap_or("-"),
            error = %e,
            "Backup failed"
        );
        manifest.fail(e.component(), e.to_string());
        self.ctx.store.save(&manifest).await?;
        Ok(manifest)
    }
}

/// One component's capture, packaged and sealed. Owns everything it needs so
/// it can run on its own task.
struct CaptureJob {
    handler: std::sync::Arc<dyn ComponentHandler>,
    component: ComponentDescriptor,
    target: EnvironmentConfig,
    staging: PathBuf,
    out_dir: PathBuf,
    encryptor: Option<Encryptor>,
    timeout: Duration,
}

impl CaptureJob {
    async fn run(self) -> Result<ArtifactRef, (String, String)> {
        let name = self.component.name.clone();
        self.capture()
            .await
            .map_err(|e| (name, format!("{e:#}")))
    }

    async fn capture(self) -> anyhow::Result<ArtifactRef> {
        remove_dir_quietly(&self.staging).await;
        tokio::fs::create_dir_all(&self.staging).await?;

        let payload = tokio::time::timeout(
            self.timeout,
            self.handler
                .capture(&self.component, &self.target, &self.staging),
        )
        .await
        .map_err(|_| anyhow!("capture timed out after {}s", self.timeout.as_secs()))??;

        let name = self.component.name.clone();
        let out_dir = self.out_dir.clone();
        let encryptor = self.encryptor.clone();
        let (packed, local_path, size_bytes) = tokio::task::spawn_blocking(move || {
            let packed = artifact::pack(&payload, &out_dir, &name)?;
            let (path, size) = match &encryptor {
                Some(enc) => artifact::seal(&packed.path, enc)?,
                None => (packed.path.clone(), packed.size_bytes),
            };
            Ok::<_, anyhow::Error>((packed, path, size))
        })
        .await??;

        remove_dir_quietly(&self.staging).await;

        Ok(ArtifactRef {
            component: self.component.name.clone(),
            local_path,
            remote_uri: None,
            size_bytes,
            checksum: packed.checksum,
            format: packed.format,
            encrypted: self.encryptor.is_some(),
            verified: false,
            upload_error: None,
        })
    }
}

async fn remove_dir_quietly(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove directory"),
    }
}

fn total_bytes(manifest: &BackupManifest) -> u64 {
    manifest.artifacts.values().map(|a| a.size_bytes).sum()
}

fn backup_event(manifest: &BackupManifest) -> DrEvent {
    DrEvent::BackupFinished {
        environment: manifest.environment.clone(),
        manifest_id: manifest.id.clone(),
        mode: manifest.mode.as_str().to_string(),
        succeeded: manifest.status == ManifestStatus::Complete,
        components: manifest.components.len(),
        total_bytes: total_bytes(manifest),
        error: manifest.failure.as_ref().map(|f| f.message.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::simulated::SimulatedPlatform;
    use crate::config::AppConfig;

    async fn coordinator(root: &Path) -> BackupCoordinator {
        let mut config = AppConfig::default();
        config.backup_root = root.join("backups");
        config.state_db = root.join("state.db");
        config.storage.root = root.join("remote");
        let db = crate::db::init_in_memory().await.unwrap();
        let ctx = AppContext::new(config, db, SimulatedPlatform::new().platform(), None).unwrap();
        BackupCoordinator::new(ctx)
    }

    #[tokio::test]
    async fn manifest_that_cannot_complete_is_failed() {
        let temp = tempfile::tempdir().unwrap();
        let coordinator = coordinator(temp.path()).await;
        let ctx = &coordinator.ctx;

        let mut manifest = BackupManifest::new(
            "production",
            BackupMode::Full,
            vec!["database".into()],
            ctx.clock.now(),
            7,
        );
        ctx.store.allocate(&mut manifest).await.unwrap();
        manifest.status = ManifestStatus::Uploading;
        ctx.store.save(&manifest).await.unwrap();

        let published = coordinator.publish(manifest, &ctx.transport()).await.unwrap();
        assert_eq!(published.status, ManifestStatus::Failed);
        let failure = published.failure.as_ref().unwrap();
        assert_eq!(failure.phase, ManifestStatus::Uploading);
        assert!(failure.message.contains("cannot complete"));

        let stored = ctx.store.load("production", &published.id).await.unwrap();
        assert_eq!(stored.status, ManifestStatus::Failed);
    }
}
