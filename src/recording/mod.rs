//! Clip recording: compositing, encoding and the session that drives both.

pub mod compositor;
pub mod encoder;
pub mod session;

pub use compositor::Compositor;
pub use encoder::{
    negotiate, EncoderBackend, EncodingSession, FfmpegEncoder, MemoryEncoder, CODEC_PREFERENCE,
};
pub use session::{RecordingHandle, RecordingManager};

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A finished, immutable recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Clip {
    #[serde(skip)]
    pub bytes: Bytes,
    pub mime_type: String,
    pub filename: String,
    pub duration_seconds: u32,
    pub frame_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Clip {
    pub fn suggested_filename(created_at: DateTime<Utc>) -> String {
        format!("phone-lunk-{}.webm", created_at.timestamp_millis())
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordingPhase {
    Idle,
    Recording,
    Finalizing,
    Ready(Arc<Clip>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordingStatus {
    pub phase: RecordingPhase,
    pub elapsed_seconds: u32,
    pub max_duration_seconds: u32,
}

impl RecordingStatus {
    pub fn idle(max_duration_seconds: u32) -> Self {
        Self {
            phase: RecordingPhase::Idle,
            elapsed_seconds: 0,
            max_duration_seconds,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.phase == RecordingPhase::Recording
    }

    pub fn remaining_seconds(&self) -> u32 {
        self.max_duration_seconds.saturating_sub(self.elapsed_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordingError {
    #[error("a recording is already in progress")]
    AlreadyRecording,
    #[error("recording is not supported: no usable video codec")]
    Unsupported,
    #[error("no matching recording in progress")]
    NotActive,
    #[error("camera stream has not produced a frame yet")]
    StreamNotReady,
    #[error("encoder failed: {0}")]
    Encoder(String),
}

impl RecordingError {
    pub(crate) fn encoder(err: anyhow::Error) -> Self {
        RecordingError::Encoder(format!("{err:#}"))
    }
}
