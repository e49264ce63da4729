use std::sync::Arc;

use bytes::BytesMut;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::alarm::AlarmSnapshot;
use crate::camera::StreamHandle;
use crate::detection::DetectionSnapshot;
use crate::settings::RecordingSettings;

use super::compositor::Compositor;
use super::encoder::{negotiate, EncoderBackend, EncodingSession};
use super::{Clip, RecordingError, RecordingPhase, RecordingStatus};

// Set to false to silence recording lifecycle logs
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

type RecordingResult = Result<Arc<Clip>, RecordingError>;

/// Identifies one recording; required to stop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingHandle {
    id: Uuid,
}

impl RecordingHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

struct ActiveRecording {
    id: Uuid,
    cancel_token: CancellationToken,
    task: JoinHandle<RecordingResult>,
}

/// Runs at most one recording at a time. Every finished clip, whether
/// stopped by hand, by the duration limit or by the camera going away, is
/// sent once on the channel returned from [`RecordingManager::new`].
pub struct RecordingManager {
    encoder: Arc<dyn EncoderBackend>,
    settings: RecordingSettings,
    active: Option<ActiveRecording>,
    status_tx: Arc<watch::Sender<RecordingStatus>>,
    clips_tx: mpsc::UnboundedSender<Arc<Clip>>,
}

impl RecordingManager {
    pub fn new(
        encoder: Arc<dyn EncoderBackend>,
        mut settings: RecordingSettings,
    ) -> (Self, mpsc::UnboundedReceiver<Arc<Clip>>) {
        settings.max_duration_secs = settings.max_duration_secs.max(1);
        settings.capture_fps = settings.capture_fps.max(1);
        settings.refresh_rate_hz = settings.refresh_rate_hz.max(1);

        let (status_tx, _) = watch::channel(RecordingStatus::idle(settings.max_duration_secs));
        let (clips_tx, clips_rx) = mpsc::unbounded_channel();

        (
            Self {
                encoder,
                settings,
                active: None,
                status_tx: Arc::new(status_tx),
                clips_tx,
            },
            clips_rx,
        )
    }

    /// Codec that would be used, or `None` when recording is unavailable.
    pub fn negotiated_mime_type(&self) -> Option<&'static str> {
        negotiate(self.encoder.as_ref())
    }

    pub fn is_supported(&self) -> bool {
        self.negotiated_mime_type().is_some()
    }

    pub fn status(&self) -> RecordingStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecordingStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_recording(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    pub fn active_handle(&self) -> Option<RecordingHandle> {
        self.active
            .as_ref()
            .filter(|active| !active.task.is_finished())
            .map(|active| RecordingHandle { id: active.id })
    }

    /// Starts compositing and encoding `stream`. A second start while one
    /// recording is running is rejected and leaves the running one alone.
    pub fn start(
        &mut self,
        stream: &StreamHandle,
        alarm: watch::Receiver<AlarmSnapshot>,
        detections: watch::Receiver<DetectionSnapshot>,
    ) -> Result<RecordingHandle, RecordingError> {
        if self.is_recording() {
            return Err(RecordingError::AlreadyRecording);
        }
        // an auto-stopped recording already delivered its clip
        self.active = None;

        let mime_type = self.negotiated_mime_type().ok_or(RecordingError::Unsupported)?;
        let (width, height) = stream.dimensions().ok_or(RecordingError::StreamNotReady)?;

        let compositor = Compositor::new(width, height, &self.settings);
        let (surface_w, surface_h) = compositor.size();
        let session = self
            .encoder
            .open(mime_type, surface_w, surface_h, self.settings.capture_fps)
            .map_err(RecordingError::encoder)?;

        let id = Uuid::new_v4();
        let cancel_token = CancellationToken::new();
        let task = RecordingTask {
            id,
            stream: stream.clone(),
            alarm,
            detections,
            compositor,
            session,
            settings: self.settings.clone(),
            status_tx: Arc::clone(&self.status_tx),
            clips_tx: self.clips_tx.clone(),
        };

        log_info!(
            "recording {id} started ({surface_w}x{surface_h}, {mime_type}, max {}s)",
            self.settings.max_duration_secs
        );
        self.status_tx.send_replace(RecordingStatus {
            phase: RecordingPhase::Recording,
            elapsed_seconds: 0,
            max_duration_seconds: self.settings.max_duration_secs,
        });

        let handle = tokio::spawn(task.run(cancel_token.clone()));
        self.active = Some(ActiveRecording {
            id,
            cancel_token,
            task: handle,
        });

        Ok(RecordingHandle { id })
    }

    /// Stops the recording and waits for its clip. Also returns the clip of
    /// a recording that already stopped itself at the duration limit.
    pub async fn stop(&mut self, handle: RecordingHandle) -> RecordingResult {
        match &self.active {
            Some(active) if active.id == handle.id => {}
            _ => return Err(RecordingError::NotActive),
        }
        self.finish_active().await.unwrap_or(Err(RecordingError::NotActive))
    }

    /// Stops whatever is running. `None` when nothing was.
    pub async fn stop_active(&mut self) -> Option<RecordingResult> {
        if !self.is_recording() {
            self.active = None;
            return None;
        }
        self.finish_active().await
    }

    async fn finish_active(&mut self) -> Option<RecordingResult> {
        let active = self.active.take()?;
        active.cancel_token.cancel();

        Some(match active.task.await {
            Ok(result) => result,
            Err(join_err) => {
                self.status_tx
                    .send_replace(RecordingStatus::idle(self.settings.max_duration_secs));
                Err(RecordingError::Encoder(format!(
                    "recording task failed to join: {join_err}"
                )))
            }
        })
    }
}

struct RecordingTask {
    id: Uuid,
    stream: StreamHandle,
    alarm: watch::Receiver<AlarmSnapshot>,
    detections: watch::Receiver<DetectionSnapshot>,
    compositor: Compositor,
    session: Box<dyn EncodingSession>,
    settings: RecordingSettings,
    status_tx: Arc<watch::Sender<RecordingStatus>>,
    clips_tx: mpsc::UnboundedSender<Arc<Clip>>,
}

impl RecordingTask {
    async fn run(mut self, cancel_token: CancellationToken) -> RecordingResult {
        let max = self.settings.max_duration_secs;
        let mime_type = self.session.mime_type().to_string();

        let mut render_ticker = time::interval(period(self.settings.refresh_rate_hz));
        render_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut capture_ticker = time::interval(period(self.settings.capture_fps));
        capture_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut second_ticker =
            time::interval_at(Instant::now() + Duration::from_secs(1), Duration::from_secs(1));

        let mut elapsed_seconds: u32 = 0;
        let mut rendered: u64 = 0;
        let mut frame_count: u64 = 0;
        let mut chunks = Vec::new();
        let mut failure: Option<RecordingError> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                _ = second_ticker.tick() => {
                    elapsed_seconds += 1;
                    self.publish(RecordingPhase::Recording, elapsed_seconds);
                    if elapsed_seconds >= max - 1 {
                        log_info!("recording {} reached {}s; stopping", self.id, elapsed_seconds);
                        break;
                    }
                }
                _ = render_ticker.tick() => {
                    self.render();
                    rendered += 1;
                }
                _ = capture_ticker.tick() => {
                    if rendered == 0 {
                        continue;
                    }
                    if let Err(err) = self.session.push_frame(self.compositor.image()) {
                        failure = Some(RecordingError::encoder(err));
                        break;
                    }
                    frame_count += 1;
                    chunks.extend(self.session.drain_chunks());
                }
            }
        }

        if failure.is_none() && frame_count == 0 {
            if rendered == 0 {
                self.render();
            }
            match self.session.push_frame(self.compositor.image()) {
                Ok(()) => frame_count += 1,
                Err(err) => failure = Some(RecordingError::encoder(err)),
            }
        }

        self.publish(RecordingPhase::Finalizing, elapsed_seconds);

        let session = self.session;
        let finished = tokio::task::spawn_blocking(move || session.finish()).await;
        let result = match (failure, finished) {
            (Some(err), _) => Err(err),
            (None, Ok(Ok(rest))) => Ok(rest),
            (None, Ok(Err(err))) => Err(RecordingError::encoder(err)),
            (None, Err(join_err)) => Err(RecordingError::Encoder(format!(
                "encoder worker join failed: {join_err}"
            ))),
        };

        let rest = match result {
            Ok(rest) => rest,
            Err(err) => {
                log_error!("recording {} failed: {err}", self.id);
                self.status_tx.send_replace(RecordingStatus::idle(max));
                return Err(err);
            }
        };
        chunks.extend(rest);

        let mut buffer = BytesMut::with_capacity(chunks.iter().map(|c| c.len()).sum());
        for chunk in &chunks {
            buffer.extend_from_slice(chunk);
        }

        let created_at = Utc::now();
        let clip = Arc::new(Clip {
            bytes: buffer.freeze(),
            mime_type,
            filename: Clip::suggested_filename(created_at),
            duration_seconds: elapsed_seconds.min(max),
            frame_count,
            created_at,
        });

        log_info!(
            "recording {} finalized: {} bytes, {} frames, {}",
            self.id,
            clip.size_bytes(),
            clip.frame_count,
            clip.mime_type
        );

        self.status_tx.send_replace(RecordingStatus {
            phase: RecordingPhase::Ready(Arc::clone(&clip)),
            elapsed_seconds: clip.duration_seconds,
            max_duration_seconds: max,
        });
        if self.clips_tx.send(Arc::clone(&clip)).is_err() {
            log_error!("clip receiver dropped; {} not delivered", clip.filename);
        }

        Ok(clip)
    }

    fn render(&mut self) {
        let frame = self.stream.current_frame();
        let overlay = self.detections.borrow().overlay.clone();
        let phase = self.alarm.borrow().phase;
        self.compositor
            .render(frame.as_ref(), overlay.as_deref(), phase);
    }

    fn publish(&self, phase: RecordingPhase, elapsed_seconds: u32) {
        self.status_tx.send_replace(RecordingStatus {
            phase,
            elapsed_seconds,
            max_duration_seconds: self.settings.max_duration_secs,
        });
    }
}

fn period(rate_hz: u32) -> Duration {
    Duration::from_secs_f64(1.0 / rate_hz.max(1) as f64)
}
