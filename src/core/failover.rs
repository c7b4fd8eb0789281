//! Traffic cutover between sites.
//!
//! Order is fixed: target health, current record, confirmation, optional
//! resync, DNS upsert, TTL wait. An unhealthy target stops the event before
//! any DNS call is made.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use super::manifest::ManifestRef;
use super::notifications::DrEvent;
use super::restore::RestoreOrchestrator;
use crate::config::SiteConfig;
use crate::context::AppContext;
use crate::db;
use crate::error::{DrError, DrResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailoverOutcome {
    Succeeded,
    Refused,
    Failed,
}

impl FailoverOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Refused => "refused",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(Self::Succeeded),
            "refused" => Some(Self::Refused),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// CLI exit code for an event with this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Succeeded => 0,
            Self::Failed => 1,
            Self::Refused => 3,
        }
    }
}

/// Immutable audit record of one failover invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailoverEvent {
    pub id: String,
    pub source_site: String,
    pub target_site: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub data_resynced: bool,
    pub dns_updated: bool,
    pub outcome: FailoverOutcome,
    pub detail: Option<String>,
}

/// Operator confirmation before a cutover.
#[async_trait]
pub trait Confirmation: Send + Sync {
    async fn confirm(&self, prompt: &str) -> anyhow::Result<bool>;
}

/// Asks on the terminal; only an explicit `yes` confirms.
pub struct StdinConfirmation;

#[async_trait]
impl Confirmation for StdinConfirmation {
    async fn confirm(&self, prompt: &str) -> anyhow::Result<bool> {
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            use std::io::{Write, stdin, stdout};

            println!("{prompt}");
            print!("Type 'yes' to proceed: ");
            stdout().flush()?;

            let mut input = String::new();
            stdin().read_line(&mut input)?;
            Ok::<_, anyhow::Error>(input.trim().eq_ignore_ascii_case("yes"))
        })
        .await?
    }
}

/// Brings the target site's data up to date before traffic moves.
#[async_trait]
pub trait DataResync: Send + Sync {
    async fn resync(&self, source: &SiteConfig, target: &SiteConfig) -> DrResult<()>;
}

/// Restores the source environment's newest complete manifest into the
/// target environment.
pub struct ManifestResync {
    ctx: AppContext,
}

impl ManifestResync {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl DataResync for ManifestResync {
    async fn resync(&self, source: &SiteConfig, target: &SiteConfig) -> DrResult<()> {
        let session = RestoreOrchestrator::new(self.ctx.clone())
            .restore(&ManifestRef::Latest, &target.environment, Some(&source.environment))
            .await?;
        if session.is_completed() {
            Ok(())
        } else {
            Err(DrError::Restore {
                session_id: session.id,
                component: session.failed_component.unwrap_or_else(|| "-".into()),
                message: session.error.unwrap_or_else(|| "restore did not complete".into()),
            })
        }
    }
}

pub struct FailoverController {
    ctx: AppContext,
    resync: Arc<dyn DataResync>,
}

impl FailoverController {
    pub fn new(ctx: AppContext) -> Self {
        let resync = Arc::new(ManifestResync::new(ctx.clone()));
        Self { ctx, resync }
    }

    pub fn with_resync(mut self, resync: Arc<dyn DataResync>) -> Self {
        self.resync = resync;
        self
    }

    /// Cut traffic over to `target_site`.
    ///
    /// `resync` overrides the configured default. `Err` is only returned when
    /// the site is unknown; every attempted event is recorded and returned.
    pub async fn failover(
        &self,
        target_site: &str,
        reason: &str,
        resync: Option<bool>,
    ) -> DrResult<FailoverEvent> {
        let target = self.ctx.config.site(target_site)?.clone();
        let mut event = FailoverEvent {
            id: Uuid::now_v7().to_string(),
            source_site: "unknown".into(),
            target_site: target.name.clone(),
            reason: reason.to_string(),
            timestamp: self.ctx.clock.now(),
            data_resynced: false,
            dns_updated: false,
            outcome: FailoverOutcome::Failed,
            detail: None,
        };

        let span = info_span!("failover", event_id = %event.id, target = %target.name);
        let result = self
            .execute(&mut event, &target, resync)
            .instrument(span)
            .await;

        match result {
            Ok(outcome) => event.outcome = outcome,
            Err(e) => {
                event.outcome = match e {
                    DrError::FailoverPrecondition { .. } => FailoverOutcome::Refused,
                    _ => FailoverOutcome::Failed,
                };
                error!(
                    event_id = %event.id,
                    target = %target.name,
                    outcome = event.outcome.as_str(),
                    dns_updated = event.dns_updated,
                    error = %e,
                    "Failover did not complete"
                );
                event.detail = Some(e.to_string());
            }
        }

        if let Err(e) = db::failovers::append(&self.ctx.db, &event).await {
            error!(event_id = %event.id, error = %e, "Failed to append failover audit record");
        }
        self.ctx.notifier.notify(failover_event(&event)).await;
        Ok(event)
    }

    async fn execute(
        &self,
        event: &mut FailoverEvent,
        target: &SiteConfig,
        resync: Option<bool>,
    ) -> DrResult<FailoverOutcome> {
        let config = &self.ctx.config.failover;
        let platform = &self.ctx.platform;

        // Precondition: the target answers its health check
        let healthy = self
            .bounded(platform.http.probe(&target.health_url))
            .await
            .unwrap_or_else(|e| {
                warn!(url = %target.health_url, error = %e, "Target health probe errored");
                false
            });
        if !healthy {
            return Err(DrError::FailoverPrecondition {
                site: target.name.clone(),
                message: format!("health check {} did not pass", target.health_url),
            });
        }
        info!(site = %target.name, "Target site healthy");

        let current = self
            .bounded(platform.dns.current_record(&config.record_name))
            .await
            .map_err(|e| anyhow!("cannot read record {}: {e:#}", config.record_name))?;
        let current_value = current.as_ref().map(|r| r.value.clone());
        let source = current_value
            .as_deref()
            .and_then(|value| config.sites.iter().find(|s| s.endpoint == value))
            .cloned();
        if let Some(source) = &source {
            event.source_site = source.name.clone();
        }

        if current_value.as_deref() == Some(target.endpoint.as_str()) {
            info!(site = %target.name, "Target already active, nothing to change");
            event.detail = Some("target site already active".into());
            return Ok(FailoverOutcome::Succeeded);
        }

        if config.test_harness {
            warn!("Confirmation bypassed by test harness mode");
        } else {
            let prompt = format!(
                "Fail over {} from '{}' to '{}' ({})?\nReason: {}",
                config.record_name,
                event.source_site,
                target.name,
                target.endpoint,
                event.reason
            );
            let confirmed = self.ctx.confirmation.confirm(&prompt).await?;
            if !confirmed {
                info!("Operator declined failover");
                event.detail = Some("operator declined confirmation".into());
                return Ok(FailoverOutcome::Refused);
            }
        }

        if resync.unwrap_or(config.resync) {
            let Some(source) = &source else {
                return Err(DrError::Prerequisite(format!(
                    "cannot resync: record {} does not point at a known site",
                    config.record_name
                )));
            };
            info!(from = %source.environment, to = %target.environment, "Resyncing data before cutover");
            self.resync.resync(source, target).await?;
            event.data_resynced = true;
        }

        self.bounded(
            platform
                .dns
                .upsert_record(&config.record_name, &target.endpoint, config.ttl_secs),
        )
        .await
        .map_err(|e| anyhow!("DNS update failed: {e:#}"))?;
        event.dns_updated = true;
        info!(
            record = %config.record_name,
            value = %target.endpoint,
            ttl_secs = config.ttl_secs,
            "DNS record updated, waiting out TTL"
        );

        self.ctx
            .clock
            .sleep(Duration::from_secs(u64::from(config.ttl_secs)))
            .await;

        info!(site = %target.name, "Failover succeeded");
        Ok(FailoverOutcome::Succeeded)
    }

    async fn bounded<T, F>(&self, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let timeout = self.ctx.config.timeouts.probe();
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| anyhow!("timed out after {}s", timeout.as_secs()))?
    }
}

fn failover_event(event: &FailoverEvent) -> DrEvent {
    DrEvent::FailoverFinished {
        event_id: event.id.clone(),
        source_site: event.source_site.clone(),
        target_site: event.target_site.clone(),
        reason: event.reason.clone(),
        outcome: event.outcome.as_str().to_string(),
        dns_updated: event.dns_updated,
        detail: event.detail.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_to_exit_codes() {
        assert_eq!(FailoverOutcome::Succeeded.exit_code(), 0);
        assert_eq!(FailoverOutcome::Failed.exit_code(), 1);
        assert_eq!(FailoverOutcome::Refused.exit_code(), 3);
        assert_eq!(FailoverOutcome::parse("refused"), Some(FailoverOutcome::Refused));
    }
}
