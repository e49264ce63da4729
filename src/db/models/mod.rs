pub mod stats;

pub use stats::{AlarmEvent, DetectionSession, RecordingRecord, StatsSummary};
