use anyhow::{Context, Result};
use rusqlite::params;

use crate::db::{connection::Database, helpers::{to_i64, to_u64}, models::AlarmEvent};

impl Database {
    /// Stores one alarm and raises the session's running count so a crash
    /// mid-session still leaves the last known total behind.
    pub async fn record_alarm(&self, event: &AlarmEvent) -> Result<()> {
        let event = event.clone();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO alarm_events (session_id, triggered_at, detection_number)
                 VALUES (?1, ?2, ?3)",
                params![
                    event.session_id,
                    event.triggered_at.to_rfc3339(),
                    to_i64(event.detection_number)?,
                ],
            )
            .context("failed to insert alarm event")?;
            tx.execute(
                "UPDATE detection_sessions
                 SET detection_count = MAX(detection_count, ?1)
                 WHERE id = ?2",
                params![to_i64(event.detection_number)?, event.session_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn count_alarms(&self, session_id: &str) -> Result<u64> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM alarm_events WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;
            to_u64(count, "alarm count")
        })
        .await
    }
}
