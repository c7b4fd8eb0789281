//! Append-only audit log of failover events.

use anyhow::{Result, anyhow};
use tokio_rusqlite::{Connection, params, rusqlite};

use super::restores::parse_time;
use crate::core::failover::{FailoverEvent, FailoverOutcome};

pub async fn append(conn: &Connection, event: &FailoverEvent) -> Result<()> {
    let event = event.clone();
    conn.call(move |c| {
        c.execute(
            "INSERT INTO failover_events
                (id, source_site, target_site, reason, timestamp,
                 data_resynced, dns_updated, outcome, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &event.id,
                &event.source_site,
                &event.target_site,
                &event.reason,
                event.timestamp.to_rfc3339(),
                event.data_resynced,
                event.dns_updated,
                event.outcome.as_str(),
                &event.detail,
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

/// Most recent events first.
pub async fn list(conn: &Connection, limit: usize) -> Result<Vec<FailoverEvent>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = conn
        .call(move |c| {
            let mut stmt = c.prepare(
                "SELECT id, source_site, target_site, reason, timestamp,
                        data_resynced, dns_updated, outcome, detail
                 FROM failover_events
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, bool>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, Option<String>>(8)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await
        .map_err(|e| anyhow!("Failed to read failover log: {}", e))?;

    rows.into_iter()
        .map(
            |(id, source_site, target_site, reason, timestamp, data_resynced, dns_updated, outcome, detail)| {
                Ok(FailoverEvent {
                    id,
                    source_site,
                    target_site,
                    reason,
                    timestamp: parse_time(&timestamp)?,
                    data_resynced,
                    dns_updated,
                    outcome: FailoverOutcome::parse(&outcome)
                        .ok_or_else(|| anyhow!("unknown failover outcome '{}'", outcome))?,
                    detail,
                })
            },
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::{TimeZone, Utc};

    fn event(id: &str, minute: u32, outcome: FailoverOutcome) -> FailoverEvent {
        FailoverEvent {
            id: id.into(),
            source_site: "primary".into(),
            target_site: "standby".into(),
            reason: "drill".into(),
            timestamp: Utc.with_ymd_and_hms(2026, 7, 1, 9, minute, 0).unwrap(),
            data_resynced: false,
            dns_updated: outcome == FailoverOutcome::Succeeded,
            outcome,
            detail: None,
        }
    }

    #[tokio::test]
    async fn events_list_newest_first() {
        let conn = db::init_in_memory().await.unwrap();
        append(&conn, &event("a", 1, FailoverOutcome::Refused)).await.unwrap();
        append(&conn, &event("b", 2, FailoverOutcome::Succeeded)).await.unwrap();

        let events = list(&conn, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, "b");
        assert!(events[0].dns_updated);
        assert_eq!(events[1].outcome, FailoverOutcome::Refused);

        assert_eq!(list(&conn, 1).await.unwrap().len(), 1);
    }
}
