#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use drsentinel::adapters::simulated::SimulatedPlatform;
use drsentinel::config::AppConfig;
use drsentinel::context::AppContext;
use drsentinel::core::clock::ManualClock;
use drsentinel::core::crypto::{Encryptor, Passphrase};
use drsentinel::core::failover::Confirmation;
use drsentinel::core::notifications::{DrEvent, NotificationChannel, NotificationDispatcher};
use drsentinel::db;
use drsentinel::error::DrResult;

pub const RECORD: &str = "rag.example.internal";
pub const PRIMARY_ENDPOINT: &str = "ingress.primary.example.internal";
pub const STANDBY_ENDPOINT: &str = "ingress.standby.example.internal";
pub const STANDBY_HEALTH: &str = "https://ingress.standby.example.internal/healthz";

pub struct Harness {
    pub dir: TempDir,
    pub sim: SimulatedPlatform,
    pub clock: ManualClock,
    pub events: Arc<Mutex<Vec<String>>>,
    pub ctx: AppContext,
}

/// Records event titles instead of sending them.
struct Recorder(Arc<Mutex<Vec<String>>>);

#[async_trait]
impl NotificationChannel for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    async fn notify(&self, event: &DrEvent) -> DrResult<()> {
        self.0.lock().unwrap().push(event.title());
        Ok(())
    }
}

/// Fixed operator answer.
pub struct Answer(pub bool);

#[async_trait]
impl Confirmation for Answer {
    async fn confirm(&self, _prompt: &str) -> anyhow::Result<bool> {
        Ok(self.0)
    }
}

pub fn test_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.backup_root = dir.path().join("backups");
    config.state_db = dir.path().join("state.db");
    config.storage.root = dir.path().join("remote");
    config.encryption.passphrase_file = None;
    config.health.interval_secs = 1;
    config.health.max_attempts = 2;
    config.upload.max_attempts = 2;
    config.failover.test_harness = true;
    config
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub async fn harness_with(adjust: impl FnOnce(&mut AppConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    adjust(&mut config);

    let sim = SimulatedPlatform::new();
    for env in &config.environments {
        sim.seed(env, &config.components);
    }
    sim.set_record(RECORD, PRIMARY_ENDPOINT, 60);

    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 2, 0, 0).unwrap());
    let events = Arc::new(Mutex::new(Vec::new()));
    let notifier = NotificationDispatcher::new(
        vec![Arc::new(Recorder(events.clone()))],
        Duration::from_secs(5),
    );

    let conn = db::init_in_memory().await.unwrap();
    let encryptor = Encryptor::new(Passphrase::new("correct horse battery staple"));
    let ctx = AppContext::new(config, conn, sim.platform(), Some(encryptor))
        .unwrap()
        .with_clock(Arc::new(clock.clone()))
        .with_notifier(notifier);

    Harness {
        dir,
        sim,
        clock,
        events,
        ctx,
    }
}

/// Calls beginning with `restore ` in the order the simulation received them.
pub fn restore_calls(sim: &SimulatedPlatform) -> Vec<String> {
    sim.calls()
        .into_iter()
        .filter(|c| c.starts_with("restore "))
        .collect()
}
