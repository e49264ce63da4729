pub mod controller;
pub mod http;
pub mod loop_worker;
pub mod model;

pub use controller::DetectionController;
pub use http::{HttpDetector, HttpDetectorLoader};
pub use loop_worker::{detection_loop, PollContext};
pub use model::{ModelController, PlatformCapabilities};

use std::sync::Arc;

use async_trait::async_trait;
use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::camera::Frame;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One labelled detection in source-frame pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub label: String,
    pub score: f32,
    pub bbox: BoundingBox,
}

impl Prediction {
    pub fn percent(&self) -> u32 {
        (self.score.clamp(0.0, 1.0) * 100.0).round() as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "state", content = "reason")]
pub enum ModelState {
    Uninitialized,
    Loading,
    Ready,
    Failed(String),
    /// The platform lacks camera access or accelerated rendering; no load
    /// was attempted and none will be.
    Incompatible,
}

/// The external object detector.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, frame: &Frame) -> anyhow::Result<Vec<Prediction>>;
}

/// One-time loader for a [`Detector`].
#[async_trait]
pub trait DetectorLoader: Send + Sync {
    /// Whether the detector can run with hardware acceleration here.
    fn supports_acceleration(&self) -> bool {
        true
    }

    async fn load(&self) -> anyhow::Result<DetectorHandle>;
}

/// Explicitly owned detector; loaded once and shared by reference count.
pub type DetectorHandle = Arc<dyn Detector>;

/// Keeps predictions of one class above a confidence threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionFilter {
    pub target_class: String,
    pub threshold: f32,
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            target_class: "cell phone".into(),
            threshold: 0.35,
        }
    }
}

impl DetectionFilter {
    pub fn new(target_class: impl Into<String>, threshold: f32) -> Self {
        Self {
            target_class: target_class.into(),
            threshold,
        }
    }

    pub fn apply(&self, predictions: &[Prediction]) -> Vec<Prediction> {
        predictions
            .iter()
            .filter(|p| p.label == self.target_class && p.score > self.threshold)
            .cloned()
            .collect()
    }
}

/// Latest poll result as seen by downstream consumers.
#[derive(Debug, Clone, Default)]
pub struct DetectionSnapshot {
    pub sequence: u64,
    pub matches: Arc<Vec<Prediction>>,
    /// Transparent layer with the drawn boxes, sized to the source frame.
    pub overlay: Option<Arc<RgbaImage>>,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn prediction(label: &str, score: f32) -> Prediction {
        Prediction {
            label: label.into(),
            score,
            bbox: BoundingBox {
                x: 10.0,
                y: 40.0,
                width: 30.0,
                height: 20.0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::prediction;
    use super::*;

    #[test]
    fn filter_keeps_only_target_class_above_threshold() {
        let filter = DetectionFilter::default();
        let predictions = vec![
            prediction("cell phone", 0.9),
            prediction("cell phone", 0.35),
            prediction("cell phone", 0.2),
            prediction("person", 0.99),
        ];

        let kept = filter.apply(&predictions);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].score, 0.9);
    }

    #[test]
    fn percent_rounds_and_clamps() {
        assert_eq!(prediction("cell phone", 0.876).percent(), 88);
        assert_eq!(prediction("cell phone", 1.4).percent(), 100);
    }
}
