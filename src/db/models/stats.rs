//! Rows behind the stats view: one per camera session, one per alarm,
//! one per saved clip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::camera::Facing;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DetectionSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub facing: Facing,
    pub detection_count: u64,
    pub duration_secs: u64,
}

impl DetectionSession {
    pub fn start(facing: Facing, started_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            started_at,
            stopped_at: None,
            facing,
            detection_count: 0,
            duration_secs: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.stopped_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlarmEvent {
    pub session_id: String,
    pub triggered_at: DateTime<Utc>,
    pub detection_number: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingRecord {
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub mime_type: String,
    pub filename: String,
    pub size_bytes: u64,
    pub duration_secs: u64,
}

/// Lifetime totals across every recorded session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub total_sessions: u64,
    pub total_detections: u64,
    pub total_time_seconds: u64,
    pub total_recordings: u64,
    pub last_session_date: Option<DateTime<Utc>>,
}
