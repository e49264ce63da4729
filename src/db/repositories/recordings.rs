use anyhow::{Context, Result};
use rusqlite::params;

use crate::db::{connection::Database, helpers::to_i64, models::RecordingRecord};

impl Database {
    pub async fn record_clip(&self, record: &RecordingRecord) -> Result<()> {
        let record = record.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO recordings (session_id, created_at, mime_type, filename, size_bytes, duration_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.session_id,
                    record.created_at.to_rfc3339(),
                    record.mime_type,
                    record.filename,
                    to_i64(record.size_bytes)?,
                    to_i64(record.duration_secs)?,
                ],
            )
            .context("failed to insert recording")?;
            Ok(())
        })
        .await
    }
}
