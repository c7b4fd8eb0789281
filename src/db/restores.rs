//! Durable journal of restore sessions and their per-component steps.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tokio_rusqlite::{Connection, params, rusqlite};

use crate::core::restore::{ComponentStep, RestorePhase, RestoreSession, StepStatus};

pub async fn create(conn: &Connection, session: &RestoreSession) -> Result<()> {
    let session = session.clone();
    conn.call(move |c| {
        let tx = c.transaction()?;

        tx.execute(
            "INSERT INTO restore_sessions
                (id, manifest_id, source_environment, target_environment, phase,
                 failed_component, error, resumed_from, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &session.id,
                &session.manifest_id,
                &session.source_environment,
                &session.target_environment,
                session.phase.as_str(),
                &session.failed_component,
                &session.error,
                &session.resumed_from,
                session.started_at.to_rfc3339(),
                session.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;

        let now = session.started_at.to_rfc3339();
        for step in &session.steps {
            tx.execute(
                "INSERT INTO restore_steps (session_id, component, rank, status, message, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    &session.id,
                    &step.component,
                    step.rank,
                    step.status.as_str(),
                    &step.message,
                    &now
                ],
            )?;
        }

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn update_step(
    conn: &Connection,
    session_id: &str,
    step: &ComponentStep,
    at: DateTime<Utc>,
) -> Result<()> {
    let session_id = session_id.to_string();
    let component = step.component.clone();
    let status = step.status.as_str();
    let message = step.message.clone();
    conn.call(move |c| {
        c.execute(
            "UPDATE restore_steps SET status = ?3, message = ?4, updated_at = ?5
             WHERE session_id = ?1 AND component = ?2",
            params![session_id, component, status, message, at.to_rfc3339()],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn update_session(conn: &Connection, session: &RestoreSession) -> Result<()> {
    let id = session.id.clone();
    let phase = session.phase.as_str();
    let failed_component = session.failed_component.clone();
    let error = session.error.clone();
    let finished_at = session.finished_at.map(|t| t.to_rfc3339());
    conn.call(move |c| {
        c.execute(
            "UPDATE restore_sessions
             SET phase = ?2, failed_component = ?3, error = ?4, finished_at = ?5
             WHERE id = ?1",
            params![id, phase, failed_component, error, finished_at],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

/// Components already restored by the target's most recent session, with
/// that session's id.
///
/// Only resumable when that newest session belongs to `manifest_id` and did
/// not complete. Any later session into the target, whatever its manifest,
/// may have overwritten what the older one restored.
pub async fn resumable(
    conn: &Connection,
    manifest_id: &str,
    target_environment: &str,
) -> Result<Option<(String, BTreeSet<String>)>> {
    let manifest_id = manifest_id.to_string();
    let target = target_environment.to_string();
    conn.call(move |c| {
        // rowid follows insertion order even when session clocks tie
        let latest: Option<(String, String, String)> = {
            let mut stmt = c.prepare(
                "SELECT id, manifest_id, phase FROM restore_sessions
                 WHERE target_environment = ?1
                 ORDER BY rowid DESC
                 LIMIT 1",
            )?;
            let mut rows = stmt.query(params![target])?;
            match rows.next()? {
                Some(row) => Some((row.get(0)?, row.get(1)?, row.get(2)?)),
                None => None,
            }
        };

        let Some((id, latest_manifest, phase)) = latest else {
            return Ok(None);
        };
        if latest_manifest != manifest_id || phase == RestorePhase::Completed.as_str() {
            return Ok(None);
        }

        let mut stmt = c.prepare(
            "SELECT component FROM restore_steps
             WHERE session_id = ?1 AND status IN (?2, ?3)",
        )?;
        let done = stmt
            .query_map(
                params![
                    &id,
                    StepStatus::Restored.as_str(),
                    StepStatus::AlreadyRestored.as_str()
                ],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok::<_, rusqlite::Error>(Some((id, done)))
    })
    .await
    .map_err(|e| anyhow!("Failed to read restore journal: {}", e))
}

struct SessionRow {
    id: String,
    manifest_id: String,
    source_environment: String,
    target_environment: String,
    phase: String,
    failed_component: Option<String>,
    error: Option<String>,
    resumed_from: Option<String>,
    started_at: String,
    finished_at: Option<String>,
}

struct StepRow {
    component: String,
    rank: u32,
    status: String,
    message: Option<String>,
}

pub async fn get(conn: &Connection, session_id: &str) -> Result<Option<RestoreSession>> {
    let session_id = session_id.to_string();
    let rows = conn
        .call(move |c| {
            let session = {
                let mut stmt = c.prepare(
                    "SELECT id, manifest_id, source_environment, target_environment, phase,
                            failed_component, error, resumed_from, started_at, finished_at
                     FROM restore_sessions WHERE id = ?1",
                )?;
                let mut rows = stmt.query(params![session_id])?;
                match rows.next()? {
                    Some(row) => Some(SessionRow {
                        id: row.get(0)?,
                        manifest_id: row.get(1)?,
                        source_environment: row.get(2)?,
                        target_environment: row.get(3)?,
                        phase: row.get(4)?,
                        failed_component: row.get(5)?,
                        error: row.get(6)?,
                        resumed_from: row.get(7)?,
                        started_at: row.get(8)?,
                        finished_at: row.get(9)?,
                    }),
                    None => None,
                }
            };
            let Some(session) = session else {
                return Ok(None);
            };

            let mut stmt = c.prepare(
                "SELECT component, rank, status, message FROM restore_steps
                 WHERE session_id = ?1 ORDER BY rank, component",
            )?;
            let steps = stmt
                .query_map(params![&session.id], |row| {
                    Ok(StepRow {
                        component: row.get(0)?,
                        rank: row.get(1)?,
                        status: row.get(2)?,
                        message: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok::<_, rusqlite::Error>(Some((session, steps)))
        })
        .await
        .map_err(|e| anyhow!("Failed to read restore session: {}", e))?;

    let Some((row, steps)) = rows else {
        return Ok(None);
    };

    let steps = steps
        .into_iter()
        .map(|s| {
            Ok(ComponentStep {
                status: StepStatus::parse(&s.status)
                    .ok_or_else(|| anyhow!("unknown step status '{}'", s.status))?,
                component: s.component,
                rank: s.rank,
                message: s.message,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(RestoreSession {
        phase: RestorePhase::parse(&row.phase)
            .ok_or_else(|| anyhow!("unknown restore phase '{}'", row.phase))?,
        id: row.id,
        manifest_id: row.manifest_id,
        source_environment: row.source_environment,
        target_environment: row.target_environment,
        steps,
        failed_component: row.failed_component,
        error: row.error,
        resumed_from: row.resumed_from,
        started_at: parse_time(&row.started_at)?,
        finished_at: row.finished_at.as_deref().map(parse_time).transpose()?,
    }))
}

pub(crate) fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| anyhow!("bad timestamp '{}': {}", s, e))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::TimeZone;

    fn session(id: &str, phase: RestorePhase) -> RestoreSession {
        RestoreSession {
            id: id.into(),
            manifest_id: "prod-20260301T000000Z".into(),
            source_environment: "prod".into(),
            target_environment: "staging".into(),
            steps: vec![
                ComponentStep {
                    component: "database".into(),
                    rank: 0,
                    status: StepStatus::Pending,
                    message: None,
                },
                ComponentStep {
                    component: "cache".into(),
                    rank: 1,
                    status: StepStatus::Pending,
                    message: None,
                },
            ],
            phase,
            failed_component: None,
            error: None,
            resumed_from: None,
            started_at: Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn journal_round_trip() {
        let conn = db::init_in_memory().await.unwrap();
        let mut s = session("s1", RestorePhase::Prepared);
        create(&conn, &s).await.unwrap();

        s.steps[0].status = StepStatus::Restored;
        update_step(&conn, &s.id, &s.steps[0], s.started_at).await.unwrap();
        s.phase = RestorePhase::Failed;
        s.failed_component = Some("cache".into());
        s.finished_at = Some(s.started_at);
        update_session(&conn, &s).await.unwrap();

        let loaded = get(&conn, "s1").await.unwrap().unwrap();
        assert_eq!(loaded.phase, RestorePhase::Failed);
        assert_eq!(loaded.steps[0].status, StepStatus::Restored);
        assert_eq!(loaded.failed_component.as_deref(), Some("cache"));
        assert!(get(&conn, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resumable_reports_completed_steps_of_unfinished_session() {
        let conn = db::init_in_memory().await.unwrap();
        let mut s = session("s1", RestorePhase::PerComponentRestoring);
        create(&conn, &s).await.unwrap();
        s.steps[0].status = StepStatus::Restored;
        update_step(&conn, &s.id, &s.steps[0], s.started_at).await.unwrap();

        let (id, done) = resumable(&conn, &s.manifest_id, "staging")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "s1");
        assert_eq!(done.into_iter().collect::<Vec<_>>(), vec!["database".to_string()]);

        // A completed session leaves nothing to resume
        s.phase = RestorePhase::Completed;
        update_session(&conn, &s).await.unwrap();
        assert!(resumable(&conn, &s.manifest_id, "staging")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn later_session_of_another_manifest_blocks_resume() {
        let conn = db::init_in_memory().await.unwrap();
        let mut stale = session("s1", RestorePhase::Failed);
        create(&conn, &stale).await.unwrap();
        stale.steps[0].status = StepStatus::Restored;
        update_step(&conn, &stale.id, &stale.steps[0], stale.started_at).await.unwrap();

        let mut other = session("s2", RestorePhase::Completed);
        other.manifest_id = "staging-20260301T000000Z".into();
        create(&conn, &other).await.unwrap();

        assert!(resumable(&conn, &stale.manifest_id, "staging")
            .await
            .unwrap()
            .is_none());
        // Other targets are unaffected
        assert!(resumable(&conn, &stale.manifest_id, "dr").await.unwrap().is_none());
    }
}
