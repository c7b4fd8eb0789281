mod common;

use common::{Answer, PRIMARY_ENDPOINT, RECORD, STANDBY_ENDPOINT, STANDBY_HEALTH, harness, harness_with};
use drsentinel::adapters::simulated::Fault;
use drsentinel::core::{BackupCoordinator, BackupMode, FailoverController, FailoverOutcome};
use drsentinel::db;
use drsentinel::error::DrError;
use std::sync::Arc;
use std::time::Duration;

fn record_value(h: &common::Harness) -> String {
    h.sim.record(RECORD).unwrap().value
}

#[tokio::test]
async fn unhealthy_target_is_refused_without_touching_dns() {
    let h = harness().await;
    h.sim.inject(Fault::Unhealthy(STANDBY_HEALTH.into()));

    let event = FailoverController::new(h.ctx.clone())
        .failover("standby", "primary ingress down", Some(false))
        .await
        .unwrap();

    assert_eq!(event.outcome, FailoverOutcome::Refused);
    assert_eq!(event.outcome.exit_code(), 3);
    assert!(!event.dns_updated);
    assert_eq!(h.sim.dns_calls(), 0);
    assert_eq!(record_value(&h), PRIMARY_ENDPOINT);

    let history = db::failovers::list(&h.ctx.db, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, FailoverOutcome::Refused);
    assert_eq!(history[0].reason, "primary ingress down");
}

#[tokio::test]
async fn failover_to_the_active_site_changes_nothing() {
    let h = harness().await;

    let event = FailoverController::new(h.ctx.clone())
        .failover("primary", "drill", Some(false))
        .await
        .unwrap();

    assert_eq!(event.outcome, FailoverOutcome::Succeeded);
    assert!(!event.dns_updated);
    assert_eq!(event.source_site, "primary");
    // Only the read of the current record
    assert_eq!(h.sim.dns_calls(), 1);
    assert_eq!(record_value(&h), PRIMARY_ENDPOINT);
    assert!(h.clock.sleeps().is_empty());
}

#[tokio::test]
async fn healthy_standby_takes_over_and_waits_out_the_ttl() {
    let h = harness().await;

    let event = FailoverController::new(h.ctx.clone())
        .failover("standby", "region outage", Some(false))
        .await
        .unwrap();

    assert_eq!(event.outcome, FailoverOutcome::Succeeded, "{:?}", event.detail);
    assert_eq!(event.source_site, "primary");
    assert_eq!(event.target_site, "standby");
    assert!(event.dns_updated);
    assert!(!event.data_resynced);
    assert_eq!(record_value(&h), STANDBY_ENDPOINT);
    assert!(h.clock.sleeps().contains(&Duration::from_secs(60)));

    let history = db::failovers::list(&h.ctx.db, 10).await.unwrap();
    assert_eq!(history[0].id, event.id);
    assert!(history[0].dns_updated);
    assert!(
        h.events
            .lock()
            .unwrap()
            .iter()
            .any(|title| title.contains("standby"))
    );
}

#[tokio::test]
async fn declined_confirmation_is_refused() {
    let h = harness_with(|c| c.failover.test_harness = false).await;
    let ctx = h.ctx.clone().with_confirmation(Arc::new(Answer(false)));

    let event = FailoverController::new(ctx)
        .failover("standby", "region outage", Some(false))
        .await
        .unwrap();

    assert_eq!(event.outcome, FailoverOutcome::Refused);
    assert!(!event.dns_updated);
    assert_eq!(record_value(&h), PRIMARY_ENDPOINT);
    assert!(!h.sim.calls().iter().any(|c| c.starts_with("dns.upsert")));
}

#[tokio::test]
async fn confirmed_failover_proceeds() {
    let h = harness_with(|c| c.failover.test_harness = false).await;
    let ctx = h.ctx.clone().with_confirmation(Arc::new(Answer(true)));

    let event = FailoverController::new(ctx)
        .failover("standby", "region outage", Some(false))
        .await
        .unwrap();

    assert_eq!(event.outcome, FailoverOutcome::Succeeded);
    assert_eq!(record_value(&h), STANDBY_ENDPOINT);
}

#[tokio::test]
async fn resync_restores_the_source_backup_before_cutover() {
    let h = harness().await;
    BackupCoordinator::new(h.ctx.clone())
        .run("production", BackupMode::Full)
        .await
        .unwrap();
    assert_ne!(
        h.sim.database("rag-dr", "rag"),
        h.sim.database("rag-production", "rag")
    );

    let event = FailoverController::new(h.ctx.clone())
        .failover("standby", "planned migration", Some(true))
        .await
        .unwrap();

    assert_eq!(event.outcome, FailoverOutcome::Succeeded, "{:?}", event.detail);
    assert!(event.data_resynced);
    assert_eq!(
        h.sim.database("rag-dr", "rag"),
        h.sim.database("rag-production", "rag")
    );

    // Data lands before the record moves
    let calls = h.sim.calls();
    let restored = calls.iter().position(|c| c == "restore database rag-dr").unwrap();
    let upsert = calls.iter().position(|c| c.starts_with("dns.upsert")).unwrap();
    assert!(restored < upsert);
}

#[tokio::test]
async fn failed_resync_leaves_dns_alone() {
    let h = harness().await;

    // No backup exists for production, so there is nothing to resync from
    let event = FailoverController::new(h.ctx.clone())
        .failover("standby", "planned migration", Some(true))
        .await
        .unwrap();

    assert_eq!(event.outcome, FailoverOutcome::Failed);
    assert!(!event.dns_updated);
    assert_eq!(record_value(&h), PRIMARY_ENDPOINT);
}

#[tokio::test]
async fn unknown_site_is_a_config_error() {
    let h = harness().await;

    let err = FailoverController::new(h.ctx.clone())
        .failover("moon", "why not", Some(false))
        .await
        .unwrap_err();

    assert!(matches!(err, DrError::Config(_)));
    assert!(db::failovers::list(&h.ctx.db, 10).await.unwrap().is_empty());
}
