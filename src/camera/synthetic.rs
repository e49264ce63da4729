//! Test-pattern camera backend.
//!
//! Produces a moving-bar pattern at the requested resolution so the full
//! pipeline can run on machines without capture hardware. It also keeps
//! every track it ever issued, which lets callers assert that stopped
//! sessions leave no live hardware behind.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use tokio::time::Instant;

use super::{CameraBackend, CameraConfig, Facing, Frame, MediaStream, PlatformError, VideoTrack};

const PATTERN_FPS: u64 = 30;
const BAR_WIDTH: u32 = 24;

pub struct SyntheticTrack {
    id: String,
    live: AtomicBool,
}

impl SyntheticTrack {
    fn new(id: String) -> Self {
        Self {
            id,
            live: AtomicBool::new(true),
        }
    }
}

impl VideoTrack for SyntheticTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

struct SyntheticStream {
    track: Arc<SyntheticTrack>,
    width: u32,
    height: u32,
    facing: Facing,
    opened_at: Instant,
    cached: Mutex<Option<Frame>>,
}

impl SyntheticStream {
    fn render(&self, sequence: u64) -> RgbaImage {
        let background = match self.facing {
            Facing::Front => Rgba([40, 44, 52, 255]),
            Facing::Back => Rgba([24, 36, 48, 255]),
        };
        let travel = self.width.saturating_sub(BAR_WIDTH).max(1) as u64;
        let bar_x = ((sequence * 8) % travel) as u32;

        RgbaImage::from_fn(self.width, self.height, |x, y| {
            if x >= bar_x && x < bar_x + BAR_WIDTH {
                Rgba([220, 220, 220, 255])
            } else if (x / 32 + y / 32) % 2 == 0 {
                background
            } else {
                Rgba([
                    background[0].saturating_add(12),
                    background[1].saturating_add(12),
                    background[2].saturating_add(12),
                    255,
                ])
            }
        })
    }
}

impl MediaStream for SyntheticStream {
    fn tracks(&self) -> Vec<Arc<dyn VideoTrack>> {
        vec![self.track.clone() as Arc<dyn VideoTrack>]
    }

    fn current_frame(&self) -> Option<Frame> {
        if !self.track.is_live() {
            return None;
        }

        let frame_period = Duration::from_millis(1000 / PATTERN_FPS);
        let sequence = (self.opened_at.elapsed().as_millis() / frame_period.as_millis()) as u64;

        let mut cached = self.cached.lock().unwrap_or_else(|p| p.into_inner());
        match cached.as_ref() {
            Some(frame) if frame.sequence == sequence => Some(frame.clone()),
            _ => {
                let frame = Frame {
                    image: Arc::new(self.render(sequence)),
                    sequence,
                };
                *cached = Some(frame.clone());
                Some(frame)
            }
        }
    }
}

#[derive(Default)]
pub struct SyntheticCamera {
    issued: Mutex<Vec<Arc<SyntheticTrack>>>,
    requests: Mutex<Vec<CameraConfig>>,
    failures: Mutex<VecDeque<String>>,
    next_track: AtomicU64,
    unavailable: AtomicBool,
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `request_stream` fail with the given platform cause.
    pub fn fail_next(&self, platform_name: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(platform_name.to_string());
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn live_track_count(&self) -> usize {
        self.issued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|track| track.is_live())
            .count()
    }

    pub fn issued_track_count(&self) -> usize {
        self.issued.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Every config passed to `request_stream`, in order.
    pub fn requests(&self) -> Vec<CameraConfig> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl CameraBackend for SyntheticCamera {
    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn request_stream(
        &self,
        config: &CameraConfig,
    ) -> Result<Arc<dyn MediaStream>, PlatformError> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(*config);

        if let Some(name) = self
            .failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
        {
            return Err(PlatformError::new(name, "synthetic failure"));
        }

        if config.requested_width == 0 || config.requested_height == 0 {
            return Err(PlatformError::new(
                "OverconstrainedError",
                "zero-sized capture requested",
            ));
        }

        let index = self.next_track.fetch_add(1, Ordering::SeqCst);
        let track = Arc::new(SyntheticTrack::new(format!(
            "synthetic-{}-{index}",
            config.facing.as_constraint()
        )));
        self.issued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(track.clone());

        Ok(Arc::new(SyntheticStream {
            track,
            width: config.requested_width,
            height: config.requested_height,
            facing: config.facing,
            opened_at: Instant::now(),
            cached: Mutex::new(None),
        }))
    }
}
