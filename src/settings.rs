use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use crate::alarm::AlarmTimings;
use crate::camera::{CameraConfig, Facing};

pub const CONFIG_PATH_ENV: &str = "PHONELUNK_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "phonelunk.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectionSettings {
    pub target_class: String,
    pub confidence_threshold: f32,
    pub poll_interval_ms: u64,
    pub detector_endpoint: String,
    /// No timeout unless configured; a hung inference call blocks further
    /// polls until it resolves.
    pub detector_timeout_ms: Option<u64>,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            target_class: "cell phone".into(),
            confidence_threshold: 0.35,
            poll_interval_ms: 100,
            detector_endpoint: "http://127.0.0.1:8500".into(),
            detector_timeout_ms: None,
        }
    }
}

impl DetectionSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn detector_timeout(&self) -> Option<Duration> {
        self.detector_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AlarmSettings {
    pub alarm_duration_ms: u64,
    pub cooldown_period_ms: u64,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            alarm_duration_ms: 5000,
            cooldown_period_ms: 3000,
        }
    }
}

impl AlarmSettings {
    pub fn timings(&self) -> AlarmTimings {
        AlarmTimings {
            alarm_duration: Duration::from_millis(self.alarm_duration_ms),
            cooldown_period: Duration::from_millis(self.cooldown_period_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CameraSettings {
    pub facing: Facing,
    pub requested_width: u32,
    pub requested_height: u32,
    pub settle_delay_ms: u64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            facing: Facing::Back,
            requested_width: 1280,
            requested_height: 720,
            settle_delay_ms: 100,
        }
    }
}

impl CameraSettings {
    pub fn camera_config(&self) -> CameraConfig {
        CameraConfig {
            facing: self.facing,
            requested_width: self.requested_width,
            requested_height: self.requested_height,
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordingSettings {
    pub max_duration_secs: u32,
    pub capture_fps: u32,
    pub refresh_rate_hz: u32,
    pub banner_height: u32,
    pub watermark_text: String,
    pub alarm_caption: String,
    pub output_dir: PathBuf,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            max_duration_secs: 30,
            capture_fps: 30,
            refresh_rate_hz: 60,
            banner_height: 48,
            watermark_text: "phone-lunk.app".into(),
            alarm_caption: "PHONE LUNK DETECTED".into(),
            output_dir: PathBuf::from("clips"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    pub detection: DetectionSettings,
    pub alarm: AlarmSettings,
    pub camera: CameraSettings,
    pub recording: RecordingSettings,
}

/// JSON-backed settings. Missing or unreadable files fall back to defaults
/// so a corrupted config never keeps the camera from starting.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<PipelineSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!(
                    "Ignoring unparseable settings at {}: {err}",
                    path.display()
                );
                PipelineSettings::default()
            })
        } else {
            PipelineSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Resolves the config path from `PHONELUNK_CONFIG`, defaulting to
    /// `phonelunk.json` in the working directory.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> PipelineSettings {
        self.read().clone()
    }

    pub fn update<F>(&self, mutate: F) -> Result<PipelineSettings>
    where
        F: FnOnce(&mut PipelineSettings),
    {
        let mut guard = self.write();
        mutate(&mut guard);
        self.persist(&guard)?;
        Ok(guard.clone())
    }

    pub fn set_facing(&self, facing: Facing) -> Result<()> {
        self.update(|settings| settings.camera.facing = facing)
            .map(|_| ())
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)?;
        let data: PipelineSettings = serde_json::from_str(&contents)?;
        *self.write() = data;
        Ok(())
    }

    fn persist(&self, data: &PipelineSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, PipelineSettings> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PipelineSettings> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
