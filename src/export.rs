//! Where finished clips go: saved to disk under their suggested filename,
//! plus the caption and links used to share them.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use log::{error, info};
use reqwest::Url;
use serde::Serialize;

use crate::recording::Clip;

pub const SHARE_URL: &str = "https://phone-lunk.app";
const SHARE_TEXT: &str = "I just got put on blast by Phone Lunk 🚨 AI-powered gym justice is real";
const HASHTAGS: &str =
    "#PhoneLunkAlarm #GymFail #PhoneLunk #Gym #Fitness #NoPhoneZone #GymEtiquette";

/// Receives every finished clip exactly once.
pub trait ClipSink: Send + Sync {
    fn accept(&self, clip: Arc<Clip>);
}

pub fn share_caption() -> String {
    format!("I just got put on blast by @phonelunk 🚨 {HASHTAGS}")
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShareLinks {
    pub twitter: String,
    pub linkedin: String,
}

pub fn share_links() -> Result<ShareLinks> {
    let twitter = Url::parse_with_params(
        "https://twitter.com/intent/tweet",
        &[("text", SHARE_TEXT), ("url", SHARE_URL)],
    )
    .context("failed to build tweet intent URL")?;
    let linkedin = Url::parse_with_params(
        "https://www.linkedin.com/sharing/share-offsite/",
        &[("url", SHARE_URL)],
    )
    .context("failed to build LinkedIn share URL")?;

    Ok(ShareLinks {
        twitter: twitter.into(),
        linkedin: linkedin.into(),
    })
}

/// Writes clips into one output directory.
pub struct ClipExporter {
    output_dir: PathBuf,
}

impl ClipExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn save(&self, clip: &Clip) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("failed to create clip directory {}", self.output_dir.display())
        })?;

        let path = self.output_dir.join(&clip.filename);
        fs::write(&path, &clip.bytes)
            .with_context(|| format!("failed to write clip {}", path.display()))?;
        Ok(path)
    }
}

impl ClipSink for ClipExporter {
    fn accept(&self, clip: Arc<Clip>) {
        match self.save(&clip) {
            Ok(path) => info!(
                "Clip saved to {} ({} bytes, {}s)",
                path.display(),
                clip.size_bytes(),
                clip.duration_seconds
            ),
            Err(err) => error!("Failed to save clip {}: {err:#}", clip.filename),
        }
    }
}
