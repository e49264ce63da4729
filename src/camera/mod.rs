//! Camera acquisition: configuration, frame access, stream handles and the
//! mapping from platform failure names onto a closed error taxonomy.

pub mod manager;
pub mod synthetic;

pub use manager::CameraStreamManager;
pub use synthetic::SyntheticCamera;

use std::sync::Arc;

use async_trait::async_trait;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Facing {
    /// Selfie camera (`user` facing mode).
    Front,
    /// Rear camera (`environment` facing mode).
    Back,
}

impl Facing {
    pub fn flipped(self) -> Self {
        match self {
            Facing::Front => Facing::Back,
            Facing::Back => Facing::Front,
        }
    }

    /// Facing-mode constraint value understood by capture platforms.
    pub fn as_constraint(&self) -> &'static str {
        match self {
            Facing::Front => "user",
            Facing::Back => "environment",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CameraConfig {
    pub facing: Facing,
    pub requested_width: u32,
    pub requested_height: u32,
}

impl CameraConfig {
    pub fn with_facing(self, facing: Facing) -> Self {
        Self { facing, ..self }
    }
}

/// One decoded video frame. Cheap to clone; the pixels are shared and never
/// mutated after capture.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Arc<RgbaImage>,
    pub sequence: u64,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// A hardware track backing a stream. Stopping it releases the device.
pub trait VideoTrack: Send + Sync {
    fn id(&self) -> &str;
    fn stop(&self);
    fn is_live(&self) -> bool;
}

/// A live stream as handed out by a [`CameraBackend`].
pub trait MediaStream: Send + Sync {
    fn tracks(&self) -> Vec<Arc<dyn VideoTrack>>;

    /// Latest frame, or `None` until the stream has produced one (or after
    /// its tracks were stopped).
    fn current_frame(&self) -> Option<Frame>;
}

/// Failure reported by the capture platform. `name` is the symbolic cause
/// (`NotAllowedError`, `NotFoundError`, ...) and is the only input to
/// [`CameraErrorKind::from_platform_name`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{name}: {message}")]
pub struct PlatformError {
    pub name: String,
    pub message: String,
}

impl PlatformError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait CameraBackend: Send + Sync {
    /// Whether the platform exposes camera access at all.
    fn is_available(&self) -> bool {
        true
    }

    async fn request_stream(
        &self,
        config: &CameraConfig,
    ) -> Result<Arc<dyn MediaStream>, PlatformError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CameraErrorKind {
    NoDeviceFound,
    PermissionDenied,
    DeviceInUse,
    ConstraintsUnsatisfiable,
    Unknown,
}

impl CameraErrorKind {
    pub fn from_platform_name(name: &str) -> Self {
        match name {
            "NotFoundError" | "DevicesNotFoundError" => CameraErrorKind::NoDeviceFound,
            "NotAllowedError" | "PermissionDeniedError" => CameraErrorKind::PermissionDenied,
            "NotReadableError" | "TrackStartError" => CameraErrorKind::DeviceInUse,
            "OverconstrainedError" | "ConstraintNotSatisfiedError" => {
                CameraErrorKind::ConstraintsUnsatisfiable
            }
            _ => CameraErrorKind::Unknown,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            CameraErrorKind::NoDeviceFound => "No camera detected. This demo requires a webcam.",
            CameraErrorKind::PermissionDenied => {
                "Camera access denied. Please allow camera access in your browser settings."
            }
            CameraErrorKind::DeviceInUse => {
                "Camera is being used by another application. Please close other apps using the camera."
            }
            CameraErrorKind::ConstraintsUnsatisfiable => {
                "Selected camera mode not available. Try switching cameras."
            }
            CameraErrorKind::Unknown => "Camera access failed. Please try again.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CameraError {
    pub kind: CameraErrorKind,
    pub message: String,
}

impl From<CameraErrorKind> for CameraError {
    fn from(kind: CameraErrorKind) -> Self {
        Self {
            kind,
            message: kind.user_message().to_string(),
        }
    }
}

impl From<&PlatformError> for CameraError {
    fn from(err: &PlatformError) -> Self {
        CameraErrorKind::from_platform_name(&err.name).into()
    }
}

/// An acquired stream plus the config it was acquired with.
#[derive(Clone)]
pub struct StreamHandle {
    id: Uuid,
    config: CameraConfig,
    stream: Arc<dyn MediaStream>,
}

impl StreamHandle {
    pub(crate) fn new(config: CameraConfig, stream: Arc<dyn MediaStream>) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            stream,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> CameraConfig {
        self.config
    }

    pub fn current_frame(&self) -> Option<Frame> {
        self.stream.current_frame()
    }

    /// Native pixel dimensions, available once the first frame arrived.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.current_frame()
            .map(|frame| (frame.width(), frame.height()))
    }

    pub fn is_live(&self) -> bool {
        self.stream.tracks().iter().any(|track| track.is_live())
    }

    /// Stops every underlying track. Idempotent.
    pub(crate) fn release(&self) {
        for track in self.stream.tracks() {
            track.stop();
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_names_map_to_kinds() {
        let cases = [
            ("NotFoundError", CameraErrorKind::NoDeviceFound),
            ("DevicesNotFoundError", CameraErrorKind::NoDeviceFound),
            ("NotAllowedError", CameraErrorKind::PermissionDenied),
            ("PermissionDeniedError", CameraErrorKind::PermissionDenied),
            ("NotReadableError", CameraErrorKind::DeviceInUse),
            ("TrackStartError", CameraErrorKind::DeviceInUse),
            ("OverconstrainedError", CameraErrorKind::ConstraintsUnsatisfiable),
            ("ConstraintNotSatisfiedError", CameraErrorKind::ConstraintsUnsatisfiable),
            ("AbortError", CameraErrorKind::Unknown),
            ("", CameraErrorKind::Unknown),
        ];

        for (name, expected) in cases {
            assert_eq!(CameraErrorKind::from_platform_name(name), expected, "{name}");
        }
    }

    #[test]
    fn every_kind_has_a_distinct_message() {
        let kinds = [
            CameraErrorKind::NoDeviceFound,
            CameraErrorKind::PermissionDenied,
            CameraErrorKind::DeviceInUse,
            CameraErrorKind::ConstraintsUnsatisfiable,
            CameraErrorKind::Unknown,
        ];
        let mut messages: Vec<_> = kinds.iter().map(|k| k.user_message()).collect();
        messages.sort();
        messages.dedup();
        assert_eq!(messages.len(), kinds.len());
    }

    #[test]
    fn facing_flips_both_ways() {
        assert_eq!(Facing::Front.flipped(), Facing::Back);
        assert_eq!(Facing::Back.flipped(), Facing::Front);
        assert_eq!(Facing::Back.as_constraint(), "environment");
    }
}
