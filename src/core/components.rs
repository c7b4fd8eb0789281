//! Per-component capture, restore, and health evaluation.
//!
//! The orchestrators only see [`ComponentHandler`] and [`HealthProbe`];
//! [`PlatformHandler`] and [`PlatformProbe`] translate descriptors into calls
//! on the platform collaborators.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::artifact::CapturedPayload;
use super::platform::{CacheInstance, DbConnection, Platform};
use super::registry::{CaptureSpec, ComponentDescriptor, HealthCheckSpec};
use crate::config::EnvironmentConfig;

#[async_trait]
pub trait ComponentHandler: Send + Sync {
    /// Write the component's state into `staging` (an empty directory) and
    /// say what was produced. `component` is already resolved for `target`.
    async fn capture(
        &self,
        component: &ComponentDescriptor,
        target: &EnvironmentConfig,
        staging: &Path,
    ) -> Result<CapturedPayload>;

    /// Load a payload previously produced by `capture` into `target`.
    async fn restore(
        &self,
        component: &ComponentDescriptor,
        target: &EnvironmentConfig,
        payload: &CapturedPayload,
    ) -> Result<()>;
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, spec: &HealthCheckSpec, target: &EnvironmentConfig) -> Result<bool>;
}

pub struct PlatformHandler {
    platform: Platform,
}

impl PlatformHandler {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl ComponentHandler for PlatformHandler {
    async fn capture(
        &self,
        component: &ComponentDescriptor,
        target: &EnvironmentConfig,
        staging: &Path,
    ) -> Result<CapturedPayload> {
        let ns = target.namespace.as_str();
        debug!(component = %component.name, namespace = ns, "Capturing component");

        match &component.capture {
            CaptureSpec::Database {
                pod,
                database,
                user,
            } => {
                let conn = DbConnection {
                    namespace: ns.to_string(),
                    pod: pod.clone(),
                    database: database.clone(),
                    user: user.clone(),
                };
                let dump = self.platform.database.dump(&conn).await?;
                write_file(staging, &format!("{database}.dump"), &dump).await
            }
            CaptureSpec::Cache { pod, snapshot_path } => {
                let cache = CacheInstance {
                    namespace: ns.to_string(),
                    pod: pod.clone(),
                    snapshot_path: snapshot_path.clone(),
                };
                self.platform.cache.trigger_snapshot(&cache).await?;
                let snapshot = self.platform.cache.fetch_snapshot_file(&cache).await?;
                let name = Path::new(snapshot_path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "dump.rdb".to_string());
                write_file(staging, &name, &snapshot).await
            }
            CaptureSpec::VectorIndex {
                base_url,
                collections,
            } => {
                for collection in collections {
                    let name = self
                        .platform
                        .vectors
                        .create_snapshot(base_url, collection)
                        .await
                        .with_context(|| format!("snapshot of collection '{collection}'"))?;
                    let bytes = self
                        .platform
                        .vectors
                        .fetch_snapshot(base_url, collection, &name)
                        .await
                        .with_context(|| format!("download of snapshot '{name}'"))?;
                    tokio::fs::write(staging.join(format!("{collection}.snapshot")), bytes).await?;
                }
                Ok(CapturedPayload::Directory(staging.to_path_buf()))
            }
            CaptureSpec::ObjectStore { pod, path } => {
                let command = vec![
                    "tar".to_string(),
                    "-cf".to_string(),
                    "-".to_string(),
                    "-C".to_string(),
                    path.clone(),
                    ".".to_string(),
                ];
                let archive = self.platform.cluster.exec(ns, pod, &command, None).await?;
                write_file(staging, "objects.tar", &archive).await
            }
            CaptureSpec::Configuration { resources } => {
                for resource in resources {
                    let document = self
                        .platform
                        .cluster
                        .read_config(ns, resource)
                        .await
                        .with_context(|| format!("export of '{resource}'"))?;
                    let file = format!("{}.json", resource.replace('/', "-"));
                    tokio::fs::write(staging.join(file), document).await?;
                }
                Ok(CapturedPayload::Directory(staging.to_path_buf()))
            }
        }
    }

    async fn restore(
        &self,
        component: &ComponentDescriptor,
        target: &EnvironmentConfig,
        payload: &CapturedPayload,
    ) -> Result<()> {
        let ns = target.namespace.as_str();
        debug!(component = %component.name, namespace = ns, "Restoring component");

        match (&component.capture, payload) {
            (
                CaptureSpec::Database {
                    pod,
                    database,
                    user,
                },
                CapturedPayload::File(path),
            ) => {
                let conn = DbConnection {
                    namespace: ns.to_string(),
                    pod: pod.clone(),
                    database: database.clone(),
                    user: user.clone(),
                };
                let dump = tokio::fs::read(path).await?;
                self.platform
                    .database
                    .restore(&conn, dump, component.restore.clean)
                    .await
            }
            (CaptureSpec::Cache { pod, snapshot_path }, CapturedPayload::File(path)) => {
                let cache = CacheInstance {
                    namespace: ns.to_string(),
                    pod: pod.clone(),
                    snapshot_path: snapshot_path.clone(),
                };
                let snapshot = tokio::fs::read(path).await?;
                self.platform.cache.load_snapshot_file(&cache, snapshot).await
            }
            (
                CaptureSpec::VectorIndex {
                    base_url,
                    collections,
                },
                CapturedPayload::Directory(dir),
            ) => {
                for collection in collections {
                    let file = dir.join(format!("{collection}.snapshot"));
                    let bytes = tokio::fs::read(&file)
                        .await
                        .with_context(|| format!("missing snapshot for '{collection}'"))?;
                    self.platform
                        .vectors
                        .upload_snapshot(base_url, collection, bytes)
                        .await
                        .with_context(|| format!("upload of collection '{collection}'"))?;
                }
                Ok(())
            }
            (CaptureSpec::ObjectStore { pod, path }, CapturedPayload::File(archive)) => {
                if component.restore.clean {
                    let wipe = vec![
                        "find".to_string(),
                        path.clone(),
                        "-mindepth".to_string(),
                        "1".to_string(),
                        "-delete".to_string(),
                    ];
                    self.platform.cluster.exec(ns, pod, &wipe, None).await?;
                }
                let command = vec![
                    "tar".to_string(),
                    "-xf".to_string(),
                    "-".to_string(),
                    "-C".to_string(),
                    path.clone(),
                ];
                let bytes = tokio::fs::read(archive).await?;
                self.platform
                    .cluster
                    .exec(ns, pod, &command, Some(bytes))
                    .await?;
                Ok(())
            }
            (CaptureSpec::Configuration { resources }, CapturedPayload::Directory(dir)) => {
                for resource in resources {
                    let file = dir.join(format!("{}.json", resource.replace('/', "-")));
                    let document = tokio::fs::read(&file)
                        .await
                        .with_context(|| format!("missing export for '{resource}'"))?;
                    self.platform
                        .cluster
                        .apply_config(ns, document)
                        .await
                        .with_context(|| format!("apply of '{resource}'"))?;
                }
                Ok(())
            }
            (spec, payload) => bail!(
                "payload {:?} does not match a {} component",
                payload,
                spec.kind().as_str()
            ),
        }
    }
}

async fn write_file(staging: &Path, name: &str, bytes: &[u8]) -> Result<CapturedPayload> {
    let path = staging.join(name);
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(CapturedPayload::File(path))
}

pub struct PlatformProbe {
    platform: Platform,
    timeout: Duration,
}

impl PlatformProbe {
    pub fn new(platform: Platform, timeout: Duration) -> Self {
        Self { platform, timeout }
    }
}

#[async_trait]
impl HealthProbe for PlatformProbe {
    async fn check(&self, spec: &HealthCheckSpec, target: &EnvironmentConfig) -> Result<bool> {
        let ns = target.namespace.as_str();
        let probe = async {
            match spec {
                HealthCheckSpec::None => Ok(true),
                HealthCheckSpec::Http { url } => self.platform.http.probe(url).await,
                HealthCheckSpec::DeploymentReady { deployment } => Ok(self
                    .platform
                    .cluster
                    .wait_ready(ns, deployment, self.timeout)
                    .await
                    .is_ok()),
                HealthCheckSpec::Exec {
                    pod,
                    command,
                    expect,
                } => match self.platform.cluster.exec(ns, pod, command, None).await {
                    Ok(out) => Ok(match expect {
                        Some(expected) => String::from_utf8_lossy(&out).contains(expected.as_str()),
                        None => true,
                    }),
                    Err(e) => {
                        debug!(pod = %pod, error = %e, "Health exec failed");
                        Ok(false)
                    }
                },
            }
        };

        tokio::time::timeout(self.timeout, probe)
            .await
            .map_err(|_| anyhow!("health probe timed out after {}s", self.timeout.as_secs()))?
    }
}

