//! Persisted statistics: camera sessions, alarms and saved clips.

mod connection;
mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use connection::Database;
pub use models::{AlarmEvent, DetectionSession, RecordingRecord, StatsSummary};
