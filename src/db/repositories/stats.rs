use anyhow::{Context, Result};

use crate::db::{
    connection::Database,
    helpers::{parse_optional_datetime, to_u64},
    models::StatsSummary,
};

impl Database {
    pub async fn get_stats(&self) -> Result<StatsSummary> {
        self.execute(|conn| {
            let (sessions, detections, seconds, last_started): (i64, i64, i64, Option<String>) =
                conn.query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(detection_count), 0),
                            COALESCE(SUM(duration_secs), 0),
                            MAX(started_at)
                     FROM detection_sessions",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .context("failed to aggregate sessions")?;
            let recordings: i64 =
                conn.query_row("SELECT COUNT(*) FROM recordings", [], |row| row.get(0))?;

            Ok(StatsSummary {
                total_sessions: to_u64(sessions, "total_sessions")?,
                total_detections: to_u64(detections, "total_detections")?,
                total_time_seconds: to_u64(seconds, "total_time_seconds")?,
                total_recordings: to_u64(recordings, "total_recordings")?,
                last_session_date: parse_optional_datetime(last_started, "started_at")?,
            })
        })
        .await
    }

    pub async fn clear_stats(&self) -> Result<()> {
        self.execute(|conn| {
            conn.execute_batch(
                "BEGIN;
                 DELETE FROM alarm_events;
                 DELETE FROM recordings;
                 DELETE FROM detection_sessions;
                 COMMIT;",
            )
            .context("failed to clear stats")?;
            Ok(())
        })
        .await
    }
}
