//! Backup manifests: the record of one backup run and its artifacts.
//!
//! A manifest is persisted as `manifest.json` next to its artifacts under
//! `<backup_root>/<environment>/<manifest_id>/` and mirrored to remote storage
//! under the same `<environment>/<manifest_id>/` key prefix.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::core::registry::ComponentKind;
use crate::error::{DrError, DrResult};

pub const MANIFEST_FILE: &str = "manifest.json";

const ID_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

static ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<env>[a-z0-9][a-z0-9-]*?)-(?P<ts>\d{8}T\d{6}Z)(?:-(?P<seq>\d+))?$")
        .expect("manifest id pattern is a valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackupMode {
    Full,
    Incremental,
    ConfigOnly,
}

impl BackupMode {
    pub fn includes(&self, kind: ComponentKind) -> bool {
        match self {
            Self::Full => true,
            Self::Incremental => {
                matches!(kind, ComponentKind::Database | ComponentKind::Configuration)
            }
            Self::ConfigOnly => kind == ComponentKind::Configuration,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::ConfigOnly => "config-only",
        }
    }
}

impl std::fmt::Display for BackupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestStatus {
    Capturing,
    Verifying,
    Uploading,
    Complete,
    Failed,
}

impl ManifestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capturing => "capturing",
            Self::Verifying => "verifying",
            Self::Uploading => "uploading",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// Container format of a packaged artifact, before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactFormat {
    /// A single gzip-compressed file.
    Gzip,
    /// A gzip-compressed tar bundle of a directory.
    TarGz,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub component: String,
    pub local_path: PathBuf,
    #[serde(default)]
    pub remote_uri: Option<String>,
    pub size_bytes: u64,
    /// BLAKE3 hex digest of the packaged artifact before encryption.
    pub checksum: String,
    pub format: ArtifactFormat,
    pub encrypted: bool,
    pub verified: bool,
    #[serde(default)]
    pub upload_error: Option<String>,
}

impl ArtifactRef {
    pub fn file_name(&self) -> String {
        self.local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.component.clone())
    }

    pub fn is_uploaded(&self) -> bool {
        self.remote_uri.as_deref().is_some_and(|uri| !uri.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub phase: ManifestStatus,
    pub component: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub id: String,
    pub environment: String,
    pub mode: BackupMode,
    /// Components selected for this run, in rank order.
    pub components: Vec<String>,
    pub artifacts: BTreeMap<String, ArtifactRef>,
    pub status: ManifestStatus,
    pub created_at: DateTime<Utc>,
    pub retention_expiry: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure: Option<FailureRecord>,
}

impl BackupManifest {
    pub fn new(
        environment: &str,
        mode: BackupMode,
        components: Vec<String>,
        created_at: DateTime<Utc>,
        retention_days: u32,
    ) -> Self {
        Self {
            id: manifest_id(environment, created_at),
            environment: environment.to_string(),
            mode,
            components,
            artifacts: BTreeMap::new(),
            status: ManifestStatus::Capturing,
            created_at,
            retention_expiry: created_at + chrono::Duration::days(i64::from(retention_days)),
            completed_at: None,
            failure: None,
        }
    }

    /// True when every selected component has a verified, uploaded artifact.
    pub fn is_completable(&self) -> bool {
        !self.components.is_empty()
            && self.components.iter().all(|c| {
                self.artifacts
                    .get(c)
                    .is_some_and(|a| a.verified && a.is_uploaded())
            })
    }

    pub fn mark_complete(&mut self, now: DateTime<Utc>) -> DrResult<()> {
        if !self.is_completable() {
            let missing: Vec<&str> = self
                .components
                .iter()
                .filter(|c| {
                    !self
                        .artifacts
                        .get(*c)
                        .is_some_and(|a| a.verified && a.is_uploaded())
                })
                .map(String::as_str)
                .collect();
            return Err(DrError::Internal(anyhow::anyhow!(
                "manifest {} cannot complete; unverified or unuploaded: {}",
                self.id,
                missing.join(", ")
            )));
        }
        self.status = ManifestStatus::Complete;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, component: Option<&str>, message: impl Into<String>) {
        self.failure = Some(FailureRecord {
            phase: self.status,
            component: component.map(str::to_string),
            message: message.into(),
        });
        self.status = ManifestStatus::Failed;
    }

    pub fn remote_prefix(&self) -> String {
        remote_prefix(&self.environment, &self.id)
    }
}

pub fn manifest_id(environment: &str, created_at: DateTime<Utc>) -> String {
    format!("{}-{}", environment, created_at.format(ID_TIME_FORMAT))
}

/// Environment encoded in a manifest id, if the id is well formed.
pub fn environment_of(id: &str) -> Option<&str> {
    ID_PATTERN
        .captures(id)
        .and_then(|caps| caps.name("env"))
        .map(|m| m.as_str())
}

/// Creation time encoded in a manifest id, if the id is well formed.
pub fn created_at_of(id: &str) -> Option<DateTime<Utc>> {
    let caps = ID_PATTERN.captures(id)?;
    let ts = caps.name("ts")?.as_str();
    chrono::NaiveDateTime::parse_from_str(ts, ID_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn remote_prefix(environment: &str, id: &str) -> String {
    format!("{environment}/{id}/")
}

pub fn remote_key(environment: &str, id: &str, file_name: &str) -> String {
    format!("{environment}/{id}/{file_name}")
}

/// A manifest named on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestRef {
    Latest,
    Id(String),
}

impl FromStr for ManifestRef {
    type Err = DrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "latest" {
            return Ok(Self::Latest);
        }
        if ID_PATTERN.is_match(s) {
            Ok(Self::Id(s.to_string()))
        } else {
            Err(DrError::Config(format!(
                "'{s}' is neither 'latest' nor a manifest id like <environment>-YYYYMMDDTHHMMSSZ"
            )))
        }
    }
}

impl std::fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Id(id) => f.write_str(id),
        }
    }
}

/// Local manifest directories under the backup root.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn environment_dir(&self, environment: &str) -> PathBuf {
        self.root.join(environment)
    }

    pub fn manifest_dir(&self, environment: &str, id: &str) -> PathBuf {
        self.root.join(environment).join(id)
    }

    /// Reserve a fresh manifest id, suffixing `-N` if a directory already
    /// exists for the timestamp.
    pub async fn allocate(&self, manifest: &mut BackupManifest) -> DrResult<PathBuf> {
        let base = manifest.id.clone();
        let mut seq = 0u32;
        loop {
            let dir = self.manifest_dir(&manifest.environment, &manifest.id);
            match tokio::fs::metadata(&dir).await {
                Ok(_) => {
                    seq += 1;
                    manifest.id = format!("{base}-{seq}");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tokio::fs::create_dir_all(&dir)
                        .await
                        .map_err(|e| io_error("create manifest directory", &dir, e))?;
                    return Ok(dir);
                }
                Err(e) => return Err(io_error("inspect manifest directory", &dir, e)),
            }
        }
    }

    /// Write the manifest atomically: temp file, then rename over the old copy.
    pub async fn save(&self, manifest: &BackupManifest) -> DrResult<()> {
        let dir = self.manifest_dir(&manifest.environment, &manifest.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create manifest directory", &dir, e))?;

        let path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!(".{MANIFEST_FILE}.tmp"));
        let body = serde_json::to_vec_pretty(manifest).map_err(anyhow::Error::from)?;

        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| io_error("write manifest", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("replace manifest", &path, e))?;

        debug!(manifest_id = %manifest.id, status = manifest.status.as_str(), "Manifest saved");
        Ok(())
    }

    pub async fn load(&self, environment: &str, id: &str) -> DrResult<BackupManifest> {
        let path = self.manifest_dir(environment, id).join(MANIFEST_FILE);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DrError::NotFound(format!("manifest {id}")));
            }
            Err(e) => return Err(io_error("read manifest", &path, e)),
        };
        let manifest = serde_json::from_slice(&body)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        Ok(manifest)
    }

    /// All readable manifests for an environment, oldest first.
    pub async fn list(&self, environment: &str) -> DrResult<Vec<BackupManifest>> {
        let dir = self.environment_dir(environment);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("list backups", &dir, e)),
        };

        let mut manifests = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list backups", &dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().join(MANIFEST_FILE).exists() {
                continue;
            }
            match self.load(environment, &name).await {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Skipping unreadable manifest"),
            }
        }

        manifests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(manifests)
    }

    pub async fn latest_complete(&self, environment: &str) -> DrResult<Option<BackupManifest>> {
        Ok(self
            .list(environment)
            .await?
            .into_iter()
            .rev()
            .find(|m| m.status == ManifestStatus::Complete))
    }

    /// Most recent manifest interrupted mid-run for this environment and mode.
    pub async fn resumable(
        &self,
        environment: &str,
        mode: BackupMode,
    ) -> DrResult<Option<BackupManifest>> {
        Ok(self
            .list(environment)
            .await?
            .into_iter()
            .rev()
            .find(|m| m.mode == mode && !m.status.is_terminal()))
    }

    pub async fn delete(&self, environment: &str, id: &str) -> DrResult<()> {
        let dir = self.manifest_dir(environment, id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete manifest directory", &dir, e)),
        }
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> DrError {
    DrError::Internal(anyhow::anyhow!(
        "Failed to {} {}: {}",
        action,
        path.display(),
        e
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 2, 30, 0).unwrap()
    }

    fn artifact(component: &str, verified: bool, uploaded: bool) -> ArtifactRef {
        ArtifactRef {
            component: component.into(),
            local_path: PathBuf::from(format!("/tmp/{component}.gz.enc")),
            remote_uri: uploaded.then(|| format!("fs:///remote/{component}.gz.enc")),
            size_bytes: 10,
            checksum: "00".into(),
            format: ArtifactFormat::Gzip,
            encrypted: true,
            verified,
            upload_error: None,
        }
    }

    #[test]
    fn id_encodes_environment_and_time() {
        let id = manifest_id("staging-eu", at(4));
        assert_eq!(id, "staging-eu-20260304T023000Z");
        assert_eq!(environment_of(&id), Some("staging-eu"));
        assert_eq!(environment_of("staging-eu-20260304T023000Z-2"), Some("staging-eu"));
        assert_eq!(environment_of("garbage"), None);
        assert_eq!(created_at_of(&id), Some(at(4)));
        assert_eq!(created_at_of("staging-eu-20260304T023000Z-3"), Some(at(4)));
    }

    #[test]
    fn manifest_ref_parses() {
        assert_eq!("latest".parse::<ManifestRef>().unwrap(), ManifestRef::Latest);
        assert!(matches!(
            "prod-20260304T023000Z".parse::<ManifestRef>(),
            Ok(ManifestRef::Id(_))
        ));
        assert!("yesterday".parse::<ManifestRef>().is_err());
    }

    #[test]
    fn modes_select_components() {
        assert!(BackupMode::Full.includes(ComponentKind::ObjectStore));
        assert!(BackupMode::Incremental.includes(ComponentKind::Database));
        assert!(!BackupMode::Incremental.includes(ComponentKind::Cache));
        assert!(BackupMode::ConfigOnly.includes(ComponentKind::Configuration));
        assert!(!BackupMode::ConfigOnly.includes(ComponentKind::Database));
    }

    #[test]
    fn complete_requires_verified_and_uploaded() {
        let mut m = BackupManifest::new(
            "prod",
            BackupMode::Incremental,
            vec!["database".into(), "configuration".into()],
            at(1),
            30,
        );
        m.artifacts.insert("database".into(), artifact("database", true, true));
        m.artifacts
            .insert("configuration".into(), artifact("configuration", true, false));
        assert!(m.mark_complete(at(1)).is_err());
        assert_eq!(m.status, ManifestStatus::Capturing);

        m.artifacts
            .insert("configuration".into(), artifact("configuration", true, true));
        m.mark_complete(at(1)).unwrap();
        assert_eq!(m.status, ManifestStatus::Complete);
    }

    #[test]
    fn fail_records_phase() {
        let mut m = BackupManifest::new("prod", BackupMode::Full, vec![], at(1), 30);
        m.status = ManifestStatus::Uploading;
        m.fail(Some("cache"), "bucket unreachable");
        assert_eq!(m.status, ManifestStatus::Failed);
        let failure = m.failure.unwrap();
        assert_eq!(failure.phase, ManifestStatus::Uploading);
        assert_eq!(failure.component.as_deref(), Some("cache"));
    }

    #[tokio::test]
    async fn store_saves_lists_and_deletes() {
        let temp = tempdir().unwrap();
        let store = ManifestStore::new(temp.path());

        let mut older = BackupManifest::new("prod", BackupMode::Full, vec![], at(1), 30);
        older.status = ManifestStatus::Complete;
        let newer = BackupManifest::new("prod", BackupMode::Full, vec![], at(2), 30);
        store.save(&newer).await.unwrap();
        store.save(&older).await.unwrap();

        let listed = store.list("prod").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, older.id);

        let latest = store.latest_complete("prod").await.unwrap().unwrap();
        assert_eq!(latest.id, older.id);

        let resumable = store.resumable("prod", BackupMode::Full).await.unwrap();
        assert_eq!(resumable.unwrap().id, newer.id);
        assert!(store
            .resumable("prod", BackupMode::ConfigOnly)
            .await
            .unwrap()
            .is_none());

        store.delete("prod", &older.id).await.unwrap();
        assert_eq!(store.list("prod").await.unwrap().len(), 1);
        assert!(matches!(
            store.load("prod", &older.id).await,
            Err(DrError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn allocate_avoids_collisions() {
        let temp = tempdir().unwrap();
        let store = ManifestStore::new(temp.path());

        let mut first = BackupManifest::new("prod", BackupMode::Full, vec![], at(1), 30);
        store.allocate(&mut first).await.unwrap();
        let mut second = BackupManifest::new("prod", BackupMode::Full, vec![], at(1), 30);
        store.allocate(&mut second).await.unwrap();

        assert_ne!(first.id, second.id);
        assert!(second.id.ends_with("-1"));
    }
}
