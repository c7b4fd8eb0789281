mod common;

use async_trait::async_trait;
use common::harness;
use drsentinel::adapters::simulated::Fault;
use drsentinel::config::EnvironmentConfig;
use drsentinel::core::artifact::CapturedPayload;
use drsentinel::core::components::ComponentHandler;
use drsentinel::core::manifest::MANIFEST_FILE;
use drsentinel::core::registry::{ComponentDescriptor, ComponentKind};
use drsentinel::core::{BackupCoordinator, BackupManifest, BackupMode, ManifestStatus};
use drsentinel::error::{DrError, Operation};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Corrupts the database artifact on disk while the last rank is captured,
/// after the database capture has already succeeded.
struct TamperDatabaseArtifact {
    inner: Arc<dyn ComponentHandler>,
}

#[async_trait]
impl ComponentHandler for TamperDatabaseArtifact {
    async fn capture(
        &self,
        component: &ComponentDescriptor,
        target: &EnvironmentConfig,
        staging: &Path,
    ) -> anyhow::Result<CapturedPayload> {
        if component.name == "configuration" {
            let manifest_dir = staging.parent().unwrap().parent().unwrap();
            for entry in std::fs::read_dir(manifest_dir).unwrap() {
                let path = entry.unwrap().path();
                let name = path.file_name().unwrap().to_string_lossy().into_owned();
                if name.starts_with("database.") {
                    let mut bytes = std::fs::read(&path).unwrap();
                    bytes.push(0);
                    std::fs::write(&path, bytes).unwrap();
                }
            }
        }
        self.inner.capture(component, target, staging).await
    }

    async fn restore(
        &self,
        component: &ComponentDescriptor,
        target: &EnvironmentConfig,
        payload: &CapturedPayload,
    ) -> anyhow::Result<()> {
        self.inner.restore(component, target, payload).await
    }
}

fn capture_count(h: &common::Harness, component: &str) -> usize {
    let prefix = format!("capture {component} ");
    h.sim.calls().iter().filter(|c| c.starts_with(&prefix)).count()
}

/// Leaves a production manifest interrupted while uploading the object
/// store, with every artifact captured and verified.
async fn interrupted_upload(h: &common::Harness) -> BackupManifest {
    h.sim.inject(Fault::PutStalls("object-store".into()));
    let coordinator = BackupCoordinator::new(h.ctx.clone());
    let stalled = async {
        while !h
            .sim
            .calls()
            .iter()
            .any(|c| c.starts_with("storage.put") && c.contains("object-store"))
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::select! {
        _ = coordinator.run("production", BackupMode::Full) => panic!("backup finished during a stalled upload"),
        _ = stalled => {}
    }
    h.sim.clear(&Fault::PutStalls("object-store".into()));

    let mut manifests = h.ctx.store.list("production").await.unwrap();
    assert_eq!(manifests.len(), 1);
    let manifest = manifests.remove(0);
    assert_eq!(manifest.status, ManifestStatus::Uploading);
    manifest
}

#[tokio::test]
async fn full_backup_completes_with_every_component_uploaded() {
    let h = harness().await;

    let run = BackupCoordinator::new(h.ctx.clone())
        .run("production", BackupMode::Full)
        .await
        .unwrap();
    let m = &run.manifest;

    assert_eq!(m.status, ManifestStatus::Complete);
    assert_eq!(m.artifacts.len(), 5);
    assert!(m.completed_at.is_some());
    for artifact in m.artifacts.values() {
        assert!(artifact.verified, "{} not verified", artifact.component);
        assert!(artifact.is_uploaded(), "{} not uploaded", artifact.component);
        assert!(artifact.encrypted);
        assert!(artifact.local_path.exists());
    }

    let keys = h.sim.blob_keys();
    assert!(keys.contains(&format!("production/{}/{}", m.id, MANIFEST_FILE)));
    assert_eq!(keys.len(), 6);

    let stored = h.ctx.store.load("production", &m.id).await.unwrap();
    assert_eq!(&stored, m);
    assert_eq!(
        h.events.lock().unwrap().as_slice(),
        ["Backup complete: production".to_string()]
    );
}

#[tokio::test]
async fn partial_capture_failure_uploads_nothing() {
    let h = harness().await;
    h.sim.inject(Fault::Capture(ComponentKind::Cache));
    h.sim.inject(Fault::Capture(ComponentKind::ObjectStore));

    let run = BackupCoordinator::new(h.ctx.clone())
        .run("production", BackupMode::Full)
        .await
        .unwrap();
    let m = run.manifest;

    assert_eq!(m.status, ManifestStatus::Failed);
    assert!(run.prune.is_none());
    assert_eq!(h.sim.puts(), 0);
    assert!(m.artifacts.is_empty());

    let failure = m.failure.unwrap();
    assert_eq!(failure.phase, ManifestStatus::Capturing);
    assert_eq!(failure.component.as_deref(), Some("cache"));

    // Only the manifest document is left on disk
    let dir = h.ctx.store.manifest_dir("production", &m.id);
    let mut left: Vec<String> = std::fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    left.sort();
    assert_eq!(left, vec![MANIFEST_FILE.to_string()]);

    assert_eq!(
        h.events.lock().unwrap().as_slice(),
        ["Backup FAILED: production".to_string()]
    );
}

#[tokio::test]
async fn config_only_captures_configuration_alone() {
    let h = harness().await;

    let run = BackupCoordinator::new(h.ctx.clone())
        .run("staging", BackupMode::ConfigOnly)
        .await
        .unwrap();

    assert_eq!(run.manifest.status, ManifestStatus::Complete);
    assert_eq!(run.manifest.components, vec!["configuration".to_string()]);
    assert!(!h.sim.calls().iter().any(|c| c.starts_with("capture database")));
}

#[tokio::test]
async fn unreachable_cluster_is_a_prerequisite_failure() {
    let h = harness().await;
    h.sim.inject(Fault::ClusterDown);

    let err = BackupCoordinator::new(h.ctx.clone())
        .run("production", BackupMode::Full)
        .await
        .unwrap_err();

    assert!(matches!(err, DrError::Prerequisite(_)));
    assert_eq!(err.exit_code(Operation::Backup), 2);
    assert!(h.ctx.store.list("production").await.unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_storage_is_a_prerequisite_failure() {
    let h = harness().await;
    h.sim.inject(Fault::StorageDown);

    let err = BackupCoordinator::new(h.ctx.clone())
        .run("production", BackupMode::Full)
        .await
        .unwrap_err();
    assert!(matches!(err, DrError::Prerequisite(_)));
    assert!(!h.sim.calls().iter().any(|c| c.starts_with("capture ")));
}

#[tokio::test]
async fn locked_environment_is_busy() {
    let h = harness().await;
    let _held = h.ctx.locks.acquire("production", "restore").unwrap();

    let err = BackupCoordinator::new(h.ctx.clone())
        .run("production", BackupMode::Full)
        .await
        .unwrap_err();
    assert!(matches!(err, DrError::Busy { .. }));
    assert_eq!(err.exit_code(Operation::Backup), 2);
}

#[tokio::test]
async fn unknown_environment_is_rejected() {
    let h = harness().await;
    let err = BackupCoordinator::new(h.ctx.clone())
        .run("nowhere", BackupMode::Full)
        .await
        .unwrap_err();
    assert!(matches!(err, DrError::Config(_)));
}

#[tokio::test]
async fn exhausted_upload_fails_the_manifest() {
    let h = harness().await;
    h.sim.inject(Fault::PutFails("cache".into()));

    let run = BackupCoordinator::new(h.ctx.clone())
        .run("production", BackupMode::Full)
        .await
        .unwrap();
    let m = &run.manifest;

    assert_eq!(m.status, ManifestStatus::Failed);
    assert_eq!(run.exit_code(), 1);
    assert!(run.prune.is_none());
    let failure = m.failure.as_ref().unwrap();
    assert_eq!(failure.phase, ManifestStatus::Uploading);
    assert_eq!(failure.component.as_deref(), Some("cache"));
    assert!(m.artifacts["cache"].upload_error.is_some());
    assert!(m.artifacts["database"].is_uploaded());

    // Never published, so no restore can pick it up remotely
    let published = format!("production/{}/{}", m.id, MANIFEST_FILE);
    assert!(!h.sim.blob_keys().contains(&published));
    assert_eq!(
        h.events.lock().unwrap().as_slice(),
        ["Backup FAILED: production".to_string()]
    );
}

#[tokio::test]
async fn corrupted_artifact_fails_verification_and_uploads_nothing() {
    let h = harness().await;
    let handler = Arc::new(TamperDatabaseArtifact {
        inner: h.ctx.handler.clone(),
    });
    let ctx = h.ctx.clone().with_handler(handler);

    let run = BackupCoordinator::new(ctx)
        .run("production", BackupMode::Full)
        .await
        .unwrap();
    let m = &run.manifest;

    assert_eq!(m.status, ManifestStatus::Failed);
    assert_eq!(run.exit_code(), 1);
    let failure = m.failure.as_ref().unwrap();
    assert_eq!(failure.phase, ManifestStatus::Verifying);
    assert_eq!(failure.component.as_deref(), Some("database"));
    assert_eq!(h.sim.puts(), 0);

    // The bad artifact stays on disk for inspection
    let database = &m.artifacts["database"];
    assert!(!database.verified);
    assert!(database.local_path.exists());
}

#[tokio::test]
async fn rerun_resumes_an_interrupted_upload_without_recapturing() {
    let h = harness().await;
    let interrupted = interrupted_upload(&h).await;
    assert!(interrupted.artifacts.values().all(|a| a.verified));

    let run = BackupCoordinator::new(h.ctx.clone())
        .run("production", BackupMode::Full)
        .await
        .unwrap();

    assert_eq!(run.manifest.status, ManifestStatus::Complete);
    assert_eq!(run.exit_code(), 0);
    assert_eq!(run.manifest.id, interrupted.id);
    for component in ["database", "cache", "vector-index", "object-store", "configuration"] {
        assert_eq!(capture_count(&h, component), 1, "{component} captured again");
    }
    let published = format!("production/{}/{}", run.manifest.id, MANIFEST_FILE);
    assert!(h.sim.blob_keys().contains(&published));
}

#[tokio::test]
async fn failed_recapture_keeps_artifacts_verified_earlier() {
    let h = harness().await;
    let mut interrupted = interrupted_upload(&h).await;

    // As if the earlier run stopped before the cache was verified
    interrupted.artifacts.get_mut("cache").unwrap().verified = false;
    h.ctx.store.save(&interrupted).await.unwrap();
    let database = interrupted.artifacts["database"].local_path.clone();
    let stale_cache = interrupted.artifacts["cache"].local_path.clone();

    h.sim.inject(Fault::Capture(ComponentKind::Cache));
    let run = BackupCoordinator::new(h.ctx.clone())
        .run("production", BackupMode::Full)
        .await
        .unwrap();
    let m = &run.manifest;

    assert_eq!(m.id, interrupted.id);
    assert_eq!(m.status, ManifestStatus::Failed);
    assert_eq!(m.failure.as_ref().unwrap().component.as_deref(), Some("cache"));
    assert_eq!(capture_count(&h, "database"), 1);

    assert!(database.exists());
    assert!(m.artifacts.contains_key("database"));
    assert!(!m.artifacts.contains_key("cache"));
    assert!(!stale_cache.exists());
}
