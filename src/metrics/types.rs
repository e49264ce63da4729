use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One completed detector poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollMetrics {
    pub timestamp: DateTime<Utc>,
    pub inference_ms: u64,
    pub prediction_count: usize,
    pub match_count: usize,
    pub failed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    pub recent_polls: Vec<PollMetrics>,
    pub poll_count: u64,
    /// Ticks that fired while a poll was still outstanding.
    pub skipped_ticks: u64,
    pub failed_polls: u64,
    /// Polls with at least one prediction passing the filter.
    pub match_polls: u64,
}

impl MetricsSnapshot {
    pub fn average_inference_ms(&self) -> Option<f64> {
        if self.recent_polls.is_empty() {
            return None;
        }
        let total: u64 = self.recent_polls.iter().map(|p| p.inference_ms).sum();
        Some(total as f64 / self.recent_polls.len() as f64)
    }
}
