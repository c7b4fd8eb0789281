//! Restore path: resolve a manifest, stage its artifacts, restore components
//! in dependency order, restart services, and wait for health.
//!
//! Every step is journaled in the state database before the session moves
//! on, so an interrupted restore picks up at the first component that had
//! not finished.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::artifact;
use super::components::ComponentHandler;
use super::manifest::{self, ArtifactFormat, ArtifactRef, BackupManifest, ManifestRef, ManifestStatus};
use super::notifications::DrEvent;
use super::registry::{ComponentDescriptor, HealthCheckSpec, group_by_rank};
use super::retry::retry;
use crate::config::EnvironmentConfig;
use crate::context::AppContext;
use crate::db;
use crate::error::{DrError, DrResult};

const RESTORE_WORKDIR: &str = ".restore";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestorePhase {
    Prepared,
    Downloaded,
    Decrypted,
    PerComponentRestoring,
    ServicesRestarting,
    HealthVerifying,
    Completed,
    Failed,
}

impl RestorePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepared => "prepared",
            Self::Downloaded => "downloaded",
            Self::Decrypted => "decrypted",
            Self::PerComponentRestoring => "per-component-restoring",
            Self::ServicesRestarting => "services-restarting",
            Self::HealthVerifying => "health-verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::Prepared,
            Self::Downloaded,
            Self::Decrypted,
            Self::PerComponentRestoring,
            Self::ServicesRestarting,
            Self::HealthVerifying,
            Self::Completed,
            Self::Failed,
        ]
        .into_iter()
        .find(|p| p.as_str() == s)
    }
}

/// Coarse session status as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverallStatus {
    Preparing,
    Restoring,
    HealthVerifying,
    Completed,
    Failed,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Restoring => "restoring",
            Self::HealthVerifying => "health-verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Pending,
    Restoring,
    Restored,
    /// Completed by an earlier session for the same manifest and target.
    AlreadyRestored,
    Failed,
    /// Skipped because an earlier component failed.
    NotStarted,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Restoring => "restoring",
            Self::Restored => "restored",
            Self::AlreadyRestored => "already-restored",
            Self::Failed => "failed",
            Self::NotStarted => "not-started",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::Pending,
            Self::Restoring,
            Self::Restored,
            Self::AlreadyRestored,
            Self::Failed,
            Self::NotStarted,
        ]
        .into_iter()
        .find(|p| p.as_str() == s)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Restored | Self::AlreadyRestored)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentStep {
    pub component: String,
    pub rank: u32,
    pub status: StepStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreSession {
    pub id: String,
    pub manifest_id: String,
    pub source_environment: String,
    pub target_environment: String,
    /// Ascending rank order.
    pub steps: Vec<ComponentStep>,
    pub phase: RestorePhase,
    pub failed_component: Option<String>,
    pub error: Option<String>,
    /// Session whose completed steps this one skipped.
    pub resumed_from: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RestoreSession {
    pub fn overall_status(&self) -> OverallStatus {
        match self.phase {
            RestorePhase::Prepared | RestorePhase::Downloaded | RestorePhase::Decrypted => {
                OverallStatus::Preparing
            }
            RestorePhase::PerComponentRestoring | RestorePhase::ServicesRestarting => {
                OverallStatus::Restoring
            }
            RestorePhase::HealthVerifying => OverallStatus::HealthVerifying,
            RestorePhase::Completed => OverallStatus::Completed,
            RestorePhase::Failed => OverallStatus::Failed,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.phase == RestorePhase::Completed
    }

    fn step_mut(&mut self, component: &str) -> Option<&mut ComponentStep> {
        self.steps.iter_mut().find(|s| s.component == component)
    }
}

/// Why a session stopped.
struct Halt {
    component: Option<String>,
    message: String,
}

impl Halt {
    fn at(component: &str, message: impl Into<String>) -> Self {
        Self {
            component: Some(component.to_string()),
            message: message.into(),
        }
    }

    fn general(message: impl Into<String>) -> Self {
        Self {
            component: None,
            message: message.into(),
        }
    }
}

impl From<DrError> for Halt {
    fn from(e: DrError) -> Self {
        Self {
            component: e.component().map(str::to_string),
            message: e.to_string(),
        }
    }
}

/// An artifact ready to unpack: the plaintext archive and its format.
struct Staged {
    archive: PathBuf,
    format: ArtifactFormat,
}

pub struct RestoreOrchestrator {
    ctx: AppContext,
}

impl RestoreOrchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Restore `manifest` into `target_environment`.
    ///
    /// `source_environment` picks where `latest` is looked up and defaults to
    /// the target. `Err` means no session was started; a session that ran and
    /// failed is returned as `Ok` with phase `Failed`.
    pub async fn restore(
        &self,
        manifest_ref: &ManifestRef,
        target_environment: &str,
        source_environment: Option<&str>,
    ) -> DrResult<RestoreSession> {
        let span = info_span!("restore", manifest = %manifest_ref, target = target_environment);
        async {
            let target = self.ctx.config.environment(target_environment)?.clone();
            let _guard = self.ctx.locks.acquire(target_environment, "restore")?;

            let source = source_environment.unwrap_or(target_environment);
            let manifest = self.resolve_manifest(manifest_ref, source).await?;
            if manifest.status != ManifestStatus::Complete {
                return Err(DrError::Prerequisite(format!(
                    "manifest {} is {}; only complete manifests can be restored",
                    manifest.id,
                    manifest.status.as_str()
                )));
            }

            let components = self.components_for(&manifest, &target)?;
            self.check_prerequisites(&manifest, &target).await?;

            let mut session = self.open_session(&manifest, &target, &components).await?;
            info!(
                session_id = %session.id,
                manifest_id = %manifest.id,
                resumed_from = session.resumed_from.as_deref().unwrap_or("-"),
                "Restore session started"
            );

            let workdir = self
                .ctx
                .config
                .backup_root
                .join(RESTORE_WORKDIR)
                .join(&session.id);
            let outcome = self
                .execute(&mut session, &manifest, &components, &target, &workdir)
                .await;
            if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %workdir.display(), error = %e, "Failed to remove restore workdir");
                }
            }

            session.finished_at = Some(self.ctx.clock.now());
            match outcome {
                Ok(()) => {
                    session.phase = RestorePhase::Completed;
                    info!(session_id = %session.id, "Restore completed");
                }
                Err(halt) => {
                    let phase = session.phase;
                    for step in session.steps.iter_mut() {
                        if matches!(step.status, StepStatus::Pending | StepStatus::Restoring) {
                            step.status = StepStatus::NotStarted;
                        }
                    }
                    session.phase = RestorePhase::Failed;
                    session.failed_component = halt.component.clone();
                    session.error = Some(halt.message.clone());
                    error!(
                        session_id = %session.id,
                        manifest_id = %session.manifest_id,
                        phase = phase.as_str(),
                        component = halt.component.as_deref().unwrap_or("-"),
                        error = %halt.message,
                        "Restore failed; environment left partially restored, no rollback performed"
                    );
                    for step in session.steps.clone() {
                        if step.status == StepStatus::NotStarted {
                            if let Err(e) = self.journal_step(&session.id, &step).await {
                                error!(session_id = %session.id, component = %step.component, error = %e.message, "Failed to journal restore step");
                            }
                        }
                    }
                }
            }
            if let Err(e) = self.journal_session(&session).await {
                error!(session_id = %session.id, error = %e.message, "Failed to journal restore session");
            }

            self.ctx.notifier.notify(restore_event(&session)).await;
            Ok::<_, DrError>(session)
        }
        .instrument(span)
        .await
    }

    async fn resolve_manifest(&self, manifest_ref: &ManifestRef, source: &str) -> DrResult<BackupManifest> {
        let transport = self.ctx.transport();
        match manifest_ref {
            ManifestRef::Id(id) => {
                let environment = manifest::environment_of(id)
                    .ok_or_else(|| DrError::NotFound(format!("manifest {id}")))?;
                match self.ctx.store.load(environment, id).await {
                    Ok(m) => Ok(m),
                    Err(DrError::NotFound(_)) => {
                        debug!(manifest_id = %id, "Manifest not local, fetching from remote");
                        transport.fetch_manifest(environment, id).await
                    }
                    Err(e) => Err(e),
                }
            }
            ManifestRef::Latest => {
                self.ctx.config.environment(source)?;
                let local = self.ctx.store.latest_complete(source).await?;
                let remote = match transport.list_remote(source).await {
                    Ok(entries) => entries
                        .into_iter()
                        .filter_map(|r| r.manifest)
                        .filter(|m| m.status == ManifestStatus::Complete)
                        .max_by(|a, b| a.created_at.cmp(&b.created_at)),
                    Err(e) => {
                        warn!(environment = source, error = %e, "Remote listing unavailable, using local manifests only");
                        None
                    }
                };
                let newest = match (local, remote) {
                    (Some(l), Some(r)) if r.created_at > l.created_at => Some(r),
                    (Some(l), _) => Some(l),
                    (None, r) => r,
                };
                newest.ok_or_else(|| {
                    DrError::NotFound(format!("complete manifest for environment '{source}'"))
                })
            }
        }
    }

    /// Descriptors for the manifest's components, resolved for the target, in
    /// ascending rank order regardless of manifest order.
    fn components_for(
        &self,
        manifest: &BackupManifest,
        target: &EnvironmentConfig,
    ) -> DrResult<Vec<ComponentDescriptor>> {
        let wanted: BTreeSet<&str> = manifest.components.iter().map(String::as_str).collect();
        for name in &wanted {
            if self.ctx.registry.get(name).is_none() {
                return Err(DrError::Config(format!(
                    "manifest {} contains component '{name}' which is not registered",
                    manifest.id
                )));
            }
            if !manifest.artifacts.contains_key(*name) {
                return Err(DrError::Prerequisite(format!(
                    "manifest {} has no artifact for '{name}'",
                    manifest.id
                )));
            }
        }
        Ok(self
            .ctx
            .registry
            .all()
            .iter()
            .filter(|c| wanted.contains(c.name.as_str()))
            .map(|c| c.resolve(target))
            .collect())
    }

    async fn check_prerequisites(&self, manifest: &BackupManifest, target: &EnvironmentConfig) -> DrResult<()> {
        if manifest.artifacts.values().any(|a| a.encrypted) && self.ctx.encryptor.is_none() {
            return Err(DrError::Prerequisite(format!(
                "manifest {} is encrypted but no passphrase is loaded",
                manifest.id
            )));
        }
        let timeout = self.ctx.config.timeouts.probe();
        match tokio::time::timeout(timeout, self.ctx.platform.cluster.ping(&target.namespace)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DrError::Prerequisite(format!(
                "cluster namespace '{}' unreachable: {e:#}",
                target.namespace
            ))),
            Err(_) => Err(DrError::Prerequisite(format!(
                "cluster namespace '{}' did not answer within {}s",
                target.namespace,
                timeout.as_secs()
            ))),
        }
    }

    async fn open_session(
        &self,
        manifest: &BackupManifest,
        target: &EnvironmentConfig,
        components: &[ComponentDescriptor],
    ) -> DrResult<RestoreSession> {
        let previous = db::restores::resumable(&self.ctx.db, &manifest.id, &target.name).await?;
        let (resumed_from, done) = match previous {
            Some((id, done)) if !done.is_empty() => (Some(id), done),
            _ => (None, BTreeSet::new()),
        };

        let steps = components
            .iter()
            .map(|c| ComponentStep {
                component: c.name.clone(),
                rank: c.rank,
                status: if done.contains(&c.name) {
                    StepStatus::AlreadyRestored
                } else {
                    StepStatus::Pending
                },
                message: None,
            })
            .collect();

        let session = RestoreSession {
            id: Uuid::now_v7().to_string(),
            manifest_id: manifest.id.clone(),
            source_environment: manifest.environment.clone(),
            target_environment: target.name.clone(),
            steps,
            phase: RestorePhase::Prepared,
            failed_component: None,
            error: None,
            resumed_from,
            started_at: self.ctx.clock.now(),
            finished_at: None,
        };
        db::restores::create(&self.ctx.db, &session).await?;
        Ok(session)
    }

    async fn execute(
        &self,
        session: &mut RestoreSession,
        manifest: &BackupManifest,
        components: &[ComponentDescriptor],
        target: &EnvironmentConfig,
        workdir: &Path,
    ) -> Result<(), Halt> {
        tokio::fs::create_dir_all(workdir)
            .await
            .map_err(|e| Halt::general(format!("cannot create {}: {e}", workdir.display())))?;

        let pending: Vec<&ComponentDescriptor> = components
            .iter()
            .filter(|c| {
                session
                    .steps
                    .iter()
                    .any(|s| s.component == c.name && !s.status.is_done())
            })
            .collect();

        // Downloaded: only what this session still has to restore
        let mut fetched: BTreeMap<String, PathBuf> = BTreeMap::new();
        for component in &pending {
            let artifact = &manifest.artifacts[&component.name];
            let path = self.fetch(manifest, artifact, workdir).await?;
            fetched.insert(component.name.clone(), path);
        }
        self.advance(session, RestorePhase::Downloaded).await?;

        // Decrypted: plaintext archive must match the capture checksum
        let mut staged: BTreeMap<String, Staged> = BTreeMap::new();
        for component in &pending {
            let artifact = &manifest.artifacts[&component.name];
            let path = fetched[&component.name].clone();
            let plain = self.decrypt(artifact, path, workdir).await?;
            staged.insert(component.name.clone(), plain);
        }
        self.advance(session, RestorePhase::Decrypted).await?;

        self.advance(session, RestorePhase::PerComponentRestoring).await?;
        for (rank, group) in group_by_rank(pending.iter().copied()) {
            debug!(rank, components = group.len(), "Restoring rank");

            // Every step in the rank is journalled as started before any of them runs
            for component in &group {
                if let Some(step) = session.step_mut(&component.name) {
                    step.status = StepStatus::Restoring;
                }
                self.journal_component(session, &component.name).await?;
            }

            let mut tasks = JoinSet::new();
            for component in group {
                let Some(stage) = staged.remove(&component.name) else {
                    continue;
                };
                let job = RestoreJob {
                    handler: self.ctx.handler.clone(),
                    component: component.clone(),
                    target: target.clone(),
                    stage,
                    unpack_dir: workdir.join("unpacked").join(&component.name),
                    timeout: self.ctx.config.timeouts.restore(),
                };
                let span = info_span!("restore_component", component = %component.name, rank);
                tasks.spawn(job.run().instrument(span));
            }

            let mut failures: Vec<(String, String)> = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                let (name, result) = match joined {
                    Ok(r) => r,
                    Err(e) => {
                        failures.push(("unknown".into(), format!("restore task failed: {e}")));
                        continue;
                    }
                };
                match result {
                    Ok(()) => {
                        info!(component = %name, "Component restored");
                        if let Some(step) = session.step_mut(&name) {
                            step.status = StepStatus::Restored;
                        }
                    }
                    Err(message) => {
                        error!(
                            session_id = %session.id,
                            component = %name,
                            phase = RestorePhase::PerComponentRestoring.as_str(),
                            error = %message,
                            "Component restore failed"
                        );
                        if let Some(step) = session.step_mut(&name) {
                            step.status = StepStatus::Failed;
                            step.message = Some(message.clone());
                        }
                        failures.push((name.clone(), message));
                    }
                }
                // Completion must be durable before the next rank starts
                if let Err(halt) = self.journal_component(session, &name).await {
                    failures.push((name.clone(), halt.message));
                }
            }

            if !failures.is_empty() {
                failures.sort();
                let (component, message) = failures.remove(0);
                return Err(Halt::at(&component, message));
            }
        }

        self.advance(session, RestorePhase::ServicesRestarting).await?;
        self.restart_services(components, target).await?;

        self.advance(session, RestorePhase::HealthVerifying).await?;
        self.verify_health(components, target).await?;

        Ok(())
    }

    /// Use the local artifact when it is intact, otherwise download it.
    async fn fetch(
        &self,
        manifest: &BackupManifest,
        artifact: &ArtifactRef,
        workdir: &Path,
    ) -> Result<PathBuf, Halt> {
        match stage_local(artifact, &workdir.join("staged")).await {
            Ok(Some(path)) => {
                debug!(component = %artifact.component, path = %path.display(), "Staged local artifact");
                return Ok(path);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(component = %artifact.component, error = %e, "Cannot stage local artifact, falling back to remote copy");
            }
        }

        if !artifact.is_uploaded() {
            return Err(Halt::at(
                &artifact.component,
                "artifact is neither on disk nor in remote storage",
            ));
        }
        let downloads = workdir.join("downloads");
        tokio::fs::create_dir_all(&downloads)
            .await
            .map_err(|e| Halt::at(&artifact.component, e.to_string()))?;
        Ok(self.ctx.transport().download(manifest, artifact, &downloads).await?)
    }

    async fn decrypt(&self, artifact: &ArtifactRef, path: PathBuf, workdir: &Path) -> Result<Staged, Halt> {
        let component = artifact.component.clone();
        let encryptor = if artifact.encrypted {
            Some(self.ctx.encryptor.clone().ok_or_else(|| {
                Halt::at(&component, "artifact is encrypted but no passphrase is loaded")
            })?)
        } else {
            None
        };
        let plain_path = workdir.join(format!("{component}.plain"));

        let (archive, checksum) = tokio::task::spawn_blocking(move || match encryptor {
            Some(enc) => {
                let checksum = artifact::unseal(&path, &plain_path, &enc)?;
                Ok::<_, anyhow::Error>((plain_path, checksum))
            }
            None => {
                let checksum = artifact::hash_file(&path)?;
                Ok((path, checksum))
            }
        })
        .await
        .map_err(|e| Halt::at(&component, format!("decrypt task failed: {e}")))?
        .map_err(|e| Halt::at(&component, format!("{e:#}")))?;

        if checksum != artifact.checksum {
            return Err(Halt::at(
                &component,
                format!(
                    "checksum mismatch: manifest records {}, artifact has {}",
                    artifact.checksum, checksum
                ),
            ));
        }
        Ok(Staged {
            archive,
            format: artifact.format,
        })
    }

    async fn restart_services(
        &self,
        components: &[ComponentDescriptor],
        target: &EnvironmentConfig,
    ) -> Result<(), Halt> {
        let mut deployments: Vec<&str> = Vec::new();
        for component in components {
            for d in &component.restore.restart_deployments {
                if !deployments.contains(&d.as_str()) {
                    deployments.push(d);
                }
            }
        }

        let cluster = &self.ctx.platform.cluster;
        let timeout = self.ctx.config.timeouts.restart();
        for deployment in deployments {
            info!(deployment, namespace = %target.namespace, "Restarting deployment");
            let restarted = async {
                cluster.restart_deployment(&target.namespace, deployment).await?;
                cluster.wait_ready(&target.namespace, deployment, timeout).await
            };
            match tokio::time::timeout(timeout, restarted).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(Halt::general(format!("restart of deployment '{deployment}' failed: {e:#}")));
                }
                Err(_) => {
                    return Err(Halt::general(format!(
                        "deployment '{deployment}' not ready within {}s",
                        timeout.as_secs()
                    )));
                }
            }
        }
        Ok(())
    }

    async fn verify_health(
        &self,
        components: &[ComponentDescriptor],
        target: &EnvironmentConfig,
    ) -> Result<(), Halt> {
        let policy = self.ctx.config.health.retry_policy();
        for component in components {
            if component.health == HealthCheckSpec::None {
                continue;
            }
            let label = format!("health {}", component.name);
            retry(self.ctx.clock.as_ref(), &policy, &label, |attempt| async move {
                match self.ctx.probe.check(&component.health, target).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(anyhow!("unhealthy (attempt {attempt})")),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(|e| {
                Halt::at(
                    &component.name,
                    format!(
                        "health check failed after {} attempt(s): {:#}",
                        e.attempts, e.last_error
                    ),
                )
            })?;
            info!(component = %component.name, "Component healthy");
        }
        Ok(())
    }

    async fn advance(&self, session: &mut RestoreSession, phase: RestorePhase) -> Result<(), Halt> {
        session.phase = phase;
        debug!(session_id = %session.id, phase = phase.as_str(), "Restore phase");
        self.journal_session(session).await
    }

    async fn journal_component(&self, session: &RestoreSession, component: &str) -> Result<(), Halt> {
        match session.steps.iter().find(|s| s.component == component) {
            Some(step) => self.journal_step(&session.id, step).await,
            None => Ok(()),
        }
    }

    async fn journal_step(&self, session_id: &str, step: &ComponentStep) -> Result<(), Halt> {
        db::restores::update_step(&self.ctx.db, session_id, step, self.ctx.clock.now())
            .await
            .map_err(|e| Halt::at(&step.component, format!("journal write failed: {e:#}")))
    }

    async fn journal_session(&self, session: &RestoreSession) -> Result<(), Halt> {
        db::restores::update_session(&self.ctx.db, session)
            .await
            .map_err(|e| Halt::general(format!("journal write failed: {e:#}")))
    }
}

struct RestoreJob {
    handler: Arc<dyn ComponentHandler>,
    component: ComponentDescriptor,
    target: EnvironmentConfig,
    stage: Staged,
    unpack_dir: PathBuf,
    timeout: Duration,
}

impl RestoreJob {
    async fn run(self) -> (String, Result<(), String>) {
        let name = self.component.name.clone();
        let result = self.restore().await.map_err(|e| format!("{e:#}"));
        (name, result)
    }

    async fn restore(self) -> anyhow::Result<()> {
        let archive = self.stage.archive.clone();
        let format = self.stage.format;
        let dest = self.unpack_dir.clone();
        let payload =
            tokio::task::spawn_blocking(move || artifact::unpack(&archive, format, &dest)).await??;

        tokio::time::timeout(
            self.timeout,
            self.handler.restore(&self.component, &self.target, &payload),
        )
        .await
        .map_err(|_| anyhow!("restore timed out after {}s", self.timeout.as_secs()))?
    }
}

/// Give the session its own link to a local artifact so retention pruning the
/// manifest directory cannot pull it out from under the restore. Falls back
/// to a copy across filesystems. `None` when there is no usable local file.
async fn stage_local(artifact: &ArtifactRef, staged_dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    let source = artifact.local_path.clone();
    let Some(file_name) = source.file_name() else {
        return Ok(None);
    };
    let staged = staged_dir.join(file_name);
    let staged_dir = staged_dir.to_path_buf();
    let expected = artifact.size_bytes;

    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&staged_dir)?;
        let _ = std::fs::remove_file(&staged);
        if let Err(e) = std::fs::hard_link(&source, &staged) {
            if e.kind() == std::io::ErrorKind::NotFound {
                return Ok(None);
            }
            match std::fs::copy(&source, &staged) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        if std::fs::metadata(&staged)?.len() != expected {
            std::fs::remove_file(&staged)?;
            return Ok(None);
        }
        Ok::<_, anyhow::Error>(Some(staged))
    })
    .await?
}

fn restore_event(session: &RestoreSession) -> DrEvent {
    DrEvent::RestoreFinished {
        session_id: session.id.clone(),
        manifest_id: session.manifest_id.clone(),
        target_environment: session.target_environment.clone(),
        succeeded: session.is_completed(),
        failed_component: session.failed_component.clone(),
        error: session.error.clone(),
    }
}
