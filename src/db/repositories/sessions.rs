use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    helpers::{facing_as_str, parse_datetime, parse_facing, parse_optional_datetime, to_i64, to_u64},
    models::DetectionSession,
};

fn row_to_session(row: &Row) -> Result<DetectionSession> {
    let started_at: String = row.get("started_at")?;
    let stopped_at: Option<String> = row.get("stopped_at")?;
    let facing: String = row.get("facing")?;
    let detection_count: i64 = row.get("detection_count")?;
    let duration_secs: i64 = row.get("duration_secs")?;

    Ok(DetectionSession {
        id: row.get("id")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        stopped_at: parse_optional_datetime(stopped_at, "stopped_at")?,
        facing: parse_facing(&facing)?,
        detection_count: to_u64(detection_count, "detection_count")?,
        duration_secs: to_u64(duration_secs, "duration_secs")?,
    })
}

fn elapsed_secs(started_at: DateTime<Utc>, stopped_at: DateTime<Utc>) -> u64 {
    u64::try_from((stopped_at - started_at).num_seconds()).unwrap_or(0)
}

impl Database {
    pub async fn insert_session(&self, session: &DetectionSession) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO detection_sessions (id, started_at, stopped_at, facing, detection_count, duration_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.started_at.to_rfc3339(),
                    record.stopped_at.as_ref().map(|dt| dt.to_rfc3339()),
                    facing_as_str(record.facing),
                    to_i64(record.detection_count)?,
                    to_i64(record.duration_secs)?,
                ],
            )
            .context("failed to insert detection session")?;
            Ok(())
        })
        .await
    }

    /// Closes a session with its final alarm count. Duration is measured
    /// from the stored start time.
    pub async fn finish_session(
        &self,
        session_id: &str,
        detection_count: u64,
        stopped_at: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let started_at: String = conn
                .query_row(
                    "SELECT started_at FROM detection_sessions WHERE id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .with_context(|| format!("session {session_id} not found"))?;
            let started_at = parse_datetime(&started_at, "started_at")?;

            conn.execute(
                "UPDATE detection_sessions
                 SET stopped_at = ?1,
                     detection_count = ?2,
                     duration_secs = ?3
                 WHERE id = ?4",
                params![
                    stopped_at.to_rfc3339(),
                    to_i64(detection_count)?,
                    to_i64(elapsed_secs(started_at, stopped_at))?,
                    session_id,
                ],
            )
            .context("failed to finish detection session")?;
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<DetectionSession>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, started_at, stopped_at, facing, detection_count, duration_secs
                 FROM detection_sessions
                 WHERE id = ?1",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            let session = match rows.next()? {
                Some(row) => Some(row_to_session(row)?),
                None => None,
            };
            Ok(session)
        })
        .await
    }

    /// Closes sessions left open by a crash. The stop time is the last
    /// recorded alarm, or the start time when the session never alarmed.
    /// Returns how many sessions were closed.
    pub async fn mark_orphaned_sessions(&self) -> Result<usize> {
        self.execute(|conn| {
            let tx = conn.transaction()?;
            let orphans = {
                let mut stmt = tx.prepare(
                    "SELECT s.id, s.started_at, s.detection_count,
                            MAX(a.triggered_at) AS last_alarm
                     FROM detection_sessions s
                     LEFT JOIN alarm_events a ON a.session_id = s.id
                     WHERE s.stopped_at IS NULL
                     GROUP BY s.id",
                )?;
                let mut rows = stmt.query([])?;
                let mut orphans = Vec::new();
                while let Some(row) = rows.next()? {
                    let id: String = row.get(0)?;
                    let started_at: String = row.get(1)?;
                    let count: i64 = row.get(2)?;
                    let last_alarm: Option<String> = row.get(3)?;
                    orphans.push((id, started_at, count, last_alarm));
                }
                orphans
            };

            for (id, started_at, count, last_alarm) in &orphans {
                let started_at = parse_datetime(started_at, "started_at")?;
                let stopped_at = parse_optional_datetime(last_alarm.clone(), "triggered_at")?
                    .unwrap_or(started_at);
                tx.execute(
                    "UPDATE detection_sessions
                     SET stopped_at = ?1,
                         duration_secs = ?2,
                         detection_count = ?3
                     WHERE id = ?4",
                    params![
                        stopped_at.to_rfc3339(),
                        to_i64(elapsed_secs(started_at, stopped_at))?,
                        count,
                        id,
                    ],
                )?;
            }

            tx.commit()?;
            Ok(orphans.len())
        })
        .await
    }
}
