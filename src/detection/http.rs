//! Detector reached over HTTP.
//!
//! `GET {endpoint}/health` must succeed for the load to count; each poll
//! posts the frame as a JPEG multipart part to `{endpoint}/detect` and reads
//! back `[{"class": .., "score": .., "bbox": [x, y, w, h]}]`.

use std::{io::Cursor, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use crate::camera::Frame;

use super::{BoundingBox, Detector, DetectorHandle, DetectorLoader, Prediction};

#[derive(Debug, Deserialize)]
struct WirePrediction {
    class: String,
    score: f32,
    bbox: [f32; 4],
}

impl From<WirePrediction> for Prediction {
    fn from(wire: WirePrediction) -> Self {
        let [x, y, width, height] = wire.bbox;
        Prediction {
            label: wire.class,
            score: wire.score,
            bbox: BoundingBox {
                x,
                y,
                width,
                height,
            },
        }
    }
}

pub struct HttpDetectorLoader {
    endpoint: String,
    timeout: Option<Duration>,
}

impl HttpDetectorLoader {
    pub fn new(endpoint: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl DetectorLoader for HttpDetectorLoader {
    async fn load(&self) -> Result<DetectorHandle> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("failed to build detector HTTP client")?;

        let url = format!("{}/health", self.endpoint);
        let resp = client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("detector unreachable at {url}"))?;
        if !resp.status().is_success() {
            bail!("detector health check failed: {}", resp.status());
        }

        log::info!("Detector available at {}", self.endpoint);
        Ok(Arc::new(HttpDetector {
            client,
            detect_url: format!("{}/detect", self.endpoint),
        }))
    }
}

pub struct HttpDetector {
    client: reqwest::Client,
    detect_url: String,
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Prediction>> {
        let image = Arc::clone(&frame.image);
        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&image))
            .await
            .context("jpeg encode worker join failed")??;

        let form = Form::new().part(
            "frame",
            Part::bytes(jpeg)
                .file_name("frame.jpg")
                .mime_str("image/jpeg")?,
        );

        let resp = self
            .client
            .post(&self.detect_url)
            .multipart(form)
            .send()
            .await
            .context("detector request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("detector returned {status}: {body}");
        }

        let wire: Vec<WirePrediction> = resp
            .json()
            .await
            .context("detector returned malformed predictions")?;
        Ok(wire.into_iter().map(Prediction::from).collect())
    }
}

fn encode_jpeg(image: &image::RgbaImage) -> Result<Vec<u8>> {
    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(rgb)
        .write_to(&mut bytes, ImageFormat::Jpeg)
        .context("failed to encode frame as JPEG")?;
    Ok(bytes.into_inner())
}
