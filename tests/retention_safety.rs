mod common;

use common::harness;
use drsentinel::core::{BackupCoordinator, BackupMode, ManifestStatus};

#[tokio::test]
async fn sole_expired_manifest_survives_pruning() {
    let h = harness().await;
    let first = BackupCoordinator::new(h.ctx.clone())
        .run("production", BackupMode::Full)
        .await
        .unwrap();
    assert_eq!(first.manifest.status, ManifestStatus::Complete);

    h.clock.advance(chrono::Duration::days(40));
    let report = h.ctx.retention().prune("production", 30).await.unwrap();

    assert_eq!(report.protected.as_deref(), Some(first.manifest.id.as_str()));
    assert!(report.deleted_local.is_empty());
    assert!(report.deleted_remote.is_empty());
    assert!(report.is_clean());
    assert!(h.ctx.store.load("production", &first.manifest.id).await.is_ok());
}

#[tokio::test]
async fn newer_backup_releases_the_expired_one() {
    let h = harness().await;
    let first = BackupCoordinator::new(h.ctx.clone())
        .run("production", BackupMode::Full)
        .await
        .unwrap();
    let first_id = first.manifest.id.clone();
    assert!(h.sim.blob_keys().iter().any(|k| k.contains(&first_id)));

    h.clock.advance(chrono::Duration::days(40));
    let second = BackupCoordinator::new(h.ctx.clone())
        .run("production", BackupMode::Full)
        .await
        .unwrap();
    assert_eq!(second.manifest.status, ManifestStatus::Complete);

    let prune = second.prune.expect("retention runs after a complete backup");
    assert_eq!(prune.protected.as_deref(), Some(second.manifest.id.as_str()));
    assert!(prune.deleted_local.contains(&first_id));
    assert!(!prune.deleted_remote.is_empty());

    assert!(h.ctx.store.load("production", &first_id).await.is_err());
    assert!(!h.sim.blob_keys().iter().any(|k| k.contains(&first_id)));
    assert!(h.sim.blob_keys().iter().any(|k| k.contains(&second.manifest.id)));
}

#[tokio::test]
async fn failed_backup_does_not_prune() {
    let h = harness().await;
    BackupCoordinator::new(h.ctx.clone())
        .run("production", BackupMode::Full)
        .await
        .unwrap();

    h.clock.advance(chrono::Duration::days(40));
    h.sim
        .inject(drsentinel::adapters::simulated::Fault::Capture(
            drsentinel::core::registry::ComponentKind::Database,
        ));
    let run = BackupCoordinator::new(h.ctx.clone())
        .run("production", BackupMode::Full)
        .await
        .unwrap();

    assert_eq!(run.manifest.status, ManifestStatus::Failed);
    assert!(run.prune.is_none());
    assert_eq!(h.ctx.store.list("production").await.unwrap().len(), 2);
}
