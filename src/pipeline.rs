//! Top-level orchestration. Owns every component for the life of the
//! process and enforces the ordering between them when a camera session
//! starts, stops or switches facing.

use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    alarm::{AlarmCallback, AlarmController, AlarmSnapshot},
    camera::{CameraBackend, CameraConfig, CameraErrorKind, CameraStreamManager, StreamHandle},
    db::{AlarmEvent, Database, DetectionSession, RecordingRecord, StatsSummary},
    detection::{
        loop_worker::PollContext, model::MODEL_LOAD_FAILED_MESSAGE, DetectionController,
        DetectionFilter, DetectionSnapshot, DetectorHandle, DetectorLoader, ModelController,
        ModelState, PlatformCapabilities,
    },
    export::ClipSink,
    metrics::{MetricsCollector, MetricsSnapshot},
    recording::{
        Clip, EncoderBackend, RecordingError, RecordingHandle, RecordingManager, RecordingStatus,
    },
    settings::PipelineSettings,
};

/// Everything a UI needs to decide what to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum PipelineStatus {
    /// Camera access or accelerated rendering is missing. Nothing to retry.
    Incompatible,
    LoadingModel,
    ModelLoadFailed { message: String },
    CameraOff,
    CameraError {
        kind: CameraErrorKind,
        message: String,
    },
    Switching,
    Monitoring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RetryAction {
    ReloadModel,
    RestartCamera,
}

impl PipelineStatus {
    /// The one operation that re-attempts whatever failed.
    pub fn retry_action(&self) -> Option<RetryAction> {
        match self {
            PipelineStatus::ModelLoadFailed { .. } => Some(RetryAction::ReloadModel),
            PipelineStatus::CameraError { .. } => Some(RetryAction::RestartCamera),
            _ => None,
        }
    }

    pub fn is_monitoring(&self) -> bool {
        matches!(self, PipelineStatus::Monitoring)
    }
}

/// External capabilities the pipeline is built from.
pub struct PipelineParts {
    pub camera: Arc<dyn CameraBackend>,
    pub loader: Arc<dyn DetectorLoader>,
    pub encoder: Arc<dyn EncoderBackend>,
    pub sink: Arc<dyn ClipSink>,
    pub db: Option<Database>,
}

struct CameraSession {
    stream: StreamHandle,
    stats: Option<DetectionSession>,
    alarm_recorder: CancellationToken,
}

struct PipelineInner {
    capabilities: PlatformCapabilities,
    /// Config of the most recent acquisition attempt; a camera retry reuses it.
    camera_config: CameraConfig,
    detection: DetectionController,
    recording: RecordingManager,
    session: Option<CameraSession>,
}

#[derive(Clone)]
pub struct PipelineController {
    settings: Arc<PipelineSettings>,
    camera: Arc<CameraStreamManager>,
    model: Arc<ModelController>,
    alarm: AlarmController,
    metrics: MetricsCollector,
    db: Option<Database>,
    snapshots: Arc<watch::Sender<DetectionSnapshot>>,
    status_tx: Arc<watch::Sender<PipelineStatus>>,
    recording_rx: watch::Receiver<RecordingStatus>,
    /// Stats row that clips finished from now on are attributed to.
    last_session_id: Arc<StdMutex<Option<String>>>,
    inner: Arc<Mutex<PipelineInner>>,
}

impl PipelineController {
    /// Must be called from within a tokio runtime: finished clips are
    /// forwarded to the sink by a background task.
    pub fn new(settings: PipelineSettings, parts: PipelineParts) -> Self {
        let camera = Arc::new(CameraStreamManager::new(
            parts.camera,
            settings.camera.settle_delay(),
        ));
        let (recording, clips_rx) = RecordingManager::new(parts.encoder, settings.recording.clone());
        let recording_rx = recording.subscribe();
        let (snapshots, _) = watch::channel(DetectionSnapshot::default());
        let (status_tx, _) = watch::channel(PipelineStatus::LoadingModel);

        let last_session_id = Arc::new(StdMutex::new(None));
        tokio::spawn(forward_clips(
            clips_rx,
            parts.sink,
            parts.db.clone(),
            Arc::clone(&last_session_id),
        ));

        Self {
            camera,
            model: Arc::new(ModelController::new(parts.loader)),
            alarm: AlarmController::new(settings.alarm.timings()),
            metrics: MetricsCollector::new(),
            db: parts.db,
            snapshots: Arc::new(snapshots),
            status_tx: Arc::new(status_tx),
            recording_rx,
            inner: Arc::new(Mutex::new(PipelineInner {
                capabilities: PlatformCapabilities {
                    camera_access: true,
                    accelerated_rendering: true,
                },
                camera_config: settings.camera.camera_config(),
                detection: DetectionController::new(),
                recording,
                session: None,
            })),
            settings: Arc::new(settings),
            last_session_id,
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<PipelineStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_alarm(&self) -> watch::Receiver<AlarmSnapshot> {
        self.alarm.subscribe()
    }

    pub fn subscribe_detections(&self) -> watch::Receiver<DetectionSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn subscribe_recording(&self) -> watch::Receiver<RecordingStatus> {
        self.recording_rx.clone()
    }

    pub fn subscribe_model(&self) -> watch::Receiver<ModelState> {
        self.model.subscribe()
    }

    pub fn alarm_snapshot(&self) -> AlarmSnapshot {
        self.alarm.snapshot()
    }

    pub fn recording_status(&self) -> RecordingStatus {
        self.recording_rx.borrow().clone()
    }

    /// Invoked once per alarm entry, never for suppressed matches.
    pub fn set_alarm_callback(&self, callback: AlarmCallback) {
        self.alarm.set_callback(callback);
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.metrics.get_snapshot().await
    }

    pub async fn camera_config(&self) -> CameraConfig {
        self.inner.lock().await.camera_config
    }

    pub async fn is_recording_supported(&self) -> bool {
        self.inner.lock().await.recording.is_supported()
    }

    pub async fn stats(&self) -> Result<StatsSummary> {
        match &self.db {
            Some(db) => db.get_stats().await,
            None => bail!("statistics are not being persisted"),
        }
    }

    pub async fn clear_stats(&self) -> Result<()> {
        match &self.db {
            Some(db) => db.clear_stats().await,
            None => bail!("statistics are not being persisted"),
        }
    }

    /// Runs the compatibility precheck and loads the detector.
    pub async fn initialize(&self, capabilities: PlatformCapabilities) -> PipelineStatus {
        let mut inner = self.inner.lock().await;
        inner.capabilities = capabilities;
        self.load_model(&inner).await
    }

    pub async fn retry_model(&self) -> PipelineStatus {
        let inner = self.inner.lock().await;
        self.load_model(&inner).await
    }

    /// Acquires the camera with the configured facing and begins polling.
    /// Camera failures come back as [`PipelineStatus::CameraError`]; `Err`
    /// is reserved for calls made in the wrong state.
    pub async fn start_camera(&self) -> Result<PipelineStatus> {
        let mut inner = self.inner.lock().await;
        let config = inner.camera_config;
        self.acquire(&mut inner, config).await
    }

    /// Re-attempts the last camera acquisition with the same config.
    pub async fn retry_camera(&self) -> Result<PipelineStatus> {
        self.start_camera().await
    }

    pub async fn retry(&self) -> Result<PipelineStatus> {
        match self.status().retry_action() {
            Some(RetryAction::ReloadModel) => Ok(self.retry_model().await),
            Some(RetryAction::RestartCamera) => self.retry_camera().await,
            None => bail!("nothing to retry"),
        }
    }

    /// Ends the camera session: cancels polling, forces the alarm idle,
    /// finalizes any open recording and only then releases the stream.
    pub async fn stop_camera(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.session.take() else {
            return Ok(());
        };

        self.halt(&mut inner).await;
        self.camera.stop(session.stream.clone());
        self.close_stats(session).await;

        self.set_status(PipelineStatus::CameraOff);
        info!("Camera session stopped");
        Ok(())
    }

    /// Flips facing. The same teardown as [`Self::stop_camera`] runs before
    /// the new stream is requested; detection count carries over.
    pub async fn switch_facing(&self) -> Result<PipelineStatus> {
        let mut inner = self.inner.lock().await;
        let detector = self.detector()?;
        let Some(session) = inner.session.take() else {
            bail!("camera is not running");
        };

        self.set_status(PipelineStatus::Switching);
        self.halt(&mut inner).await;

        let CameraSession {
            stream,
            stats,
            alarm_recorder,
        } = session;
        let current = stream.config();
        inner.camera_config = current.with_facing(current.facing.flipped());

        match self.camera.switch_facing(stream).await {
            Ok(stream) => {
                self.alarm.arm();
                if let Err(err) = self.start_detection(&mut inner, &stream, detector) {
                    self.camera.stop(stream);
                    self.finish_stats(stats, alarm_recorder).await;
                    self.set_status(PipelineStatus::CameraOff);
                    return Err(err);
                }
                inner.session = Some(CameraSession {
                    stream,
                    stats,
                    alarm_recorder,
                });
                self.set_status(PipelineStatus::Monitoring);
                Ok(PipelineStatus::Monitoring)
            }
            Err(err) => {
                self.finish_stats(stats, alarm_recorder).await;
                let status = PipelineStatus::CameraError {
                    kind: err.kind,
                    message: err.message,
                };
                self.set_status(status.clone());
                Ok(status)
            }
        }
    }

    pub async fn start_recording(&self) -> Result<RecordingHandle, RecordingError> {
        let mut inner = self.inner.lock().await;
        let stream = inner
            .session
            .as_ref()
            .map(|session| session.stream.clone())
            .ok_or(RecordingError::StreamNotReady)?;

        inner
            .recording
            .start(&stream, self.alarm.subscribe(), self.snapshots.subscribe())
    }

    /// Stops the open recording. The clip also reaches the sink.
    pub async fn stop_recording(&self) -> Result<Arc<Clip>, RecordingError> {
        let mut inner = self.inner.lock().await;
        inner
            .recording
            .stop_active()
            .await
            .unwrap_or(Err(RecordingError::NotActive))
    }

    async fn load_model(&self, inner: &PipelineInner) -> PipelineStatus {
        if inner.session.is_some() {
            return self.status();
        }

        self.set_status(PipelineStatus::LoadingModel);
        let status = match self.model.load_model(inner.capabilities).await {
            ModelState::Ready => PipelineStatus::CameraOff,
            ModelState::Incompatible => PipelineStatus::Incompatible,
            ModelState::Failed(message) => PipelineStatus::ModelLoadFailed { message },
            other => {
                warn!("Model load finished in unexpected state {other:?}");
                PipelineStatus::ModelLoadFailed {
                    message: MODEL_LOAD_FAILED_MESSAGE.to_string(),
                }
            }
        };
        self.set_status(status.clone());
        status
    }

    fn detector(&self) -> Result<DetectorHandle> {
        self.model
            .detector()
            .context("detection model is not loaded")
    }

    async fn acquire(
        &self,
        inner: &mut PipelineInner,
        config: CameraConfig,
    ) -> Result<PipelineStatus> {
        if inner.session.is_some() {
            bail!("camera already running");
        }
        let detector = self.detector()?;
        inner.camera_config = config;

        let stream = match self.camera.start(&config).await {
            Ok(stream) => stream,
            Err(err) => {
                let status = PipelineStatus::CameraError {
                    kind: err.kind,
                    message: err.message,
                };
                self.set_status(status.clone());
                return Ok(status);
            }
        };

        self.alarm.reset_session();
        self.metrics.reset().await;
        self.snapshots.send_replace(DetectionSnapshot::default());
        self.alarm.arm();

        if let Err(err) = self.start_detection(inner, &stream, detector) {
            self.alarm.force_idle();
            self.camera.stop(stream);
            return Err(err);
        }

        let stats = self.open_stats(&config).await;
        let alarm_recorder = CancellationToken::new();
        if let (Some(db), Some(stats)) = (&self.db, &stats) {
            tokio::spawn(record_alarms(
                db.clone(),
                stats.id.clone(),
                self.alarm.subscribe(),
                alarm_recorder.clone(),
            ));
        }

        inner.session = Some(CameraSession {
            stream,
            stats,
            alarm_recorder,
        });
        self.set_status(PipelineStatus::Monitoring);
        info!("Camera session started");
        Ok(PipelineStatus::Monitoring)
    }

    fn start_detection(
        &self,
        inner: &mut PipelineInner,
        stream: &StreamHandle,
        detector: DetectorHandle,
    ) -> Result<()> {
        let detection = &self.settings.detection;
        inner.detection.start(PollContext {
            stream: stream.clone(),
            detector,
            filter: DetectionFilter::new(
                detection.target_class.clone(),
                detection.confidence_threshold,
            ),
            alarm: self.alarm.clone(),
            snapshots: Arc::clone(&self.snapshots),
            metrics: self.metrics.clone(),
            poll_interval: detection.poll_interval(),
            timeout: detection.detector_timeout(),
        })
    }

    /// Shared teardown for stop and switch. Polling and the alarm are
    /// silenced synchronously before anything awaits.
    async fn halt(&self, inner: &mut PipelineInner) {
        inner.detection.cancel();
        self.alarm.force_idle();

        if let Some(result) = inner.recording.stop_active().await {
            match result {
                Ok(clip) => info!(
                    "Recording finalized by camera teardown ({} bytes)",
                    clip.size_bytes()
                ),
                Err(err) => warn!("Recording failed during camera teardown: {err}"),
            }
        }

        if let Err(err) = inner.detection.stop().await {
            error!("Detection loop did not shut down cleanly: {err:#}");
        }
        self.snapshots.send_replace(DetectionSnapshot::default());
    }

    async fn open_stats(&self, config: &CameraConfig) -> Option<DetectionSession> {
        let db = self.db.as_ref()?;
        let session = DetectionSession::start(config.facing, Utc::now());
        match db.insert_session(&session).await {
            Ok(()) => {
                *self
                    .last_session_id
                    .lock()
                    .unwrap_or_else(|p| p.into_inner()) = Some(session.id.clone());
                Some(session)
            }
            Err(err) => {
                error!("Failed to record detection session: {err:#}");
                None
            }
        }
    }

    async fn close_stats(&self, session: CameraSession) {
        self.finish_stats(session.stats, session.alarm_recorder).await;
    }

    async fn finish_stats(&self, stats: Option<DetectionSession>, alarm_recorder: CancellationToken) {
        alarm_recorder.cancel();
        let (Some(db), Some(stats)) = (&self.db, stats) else {
            return;
        };

        let count = self.alarm.snapshot().detection_count;
        if let Err(err) = db.finish_session(&stats.id, count, Utc::now()).await {
            error!("Failed to close detection session {}: {err:#}", stats.id);
        }
    }

    fn set_status(&self, status: PipelineStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Hands every finished clip to the sink and logs it in the stats store.
async fn forward_clips(
    mut clips_rx: mpsc::UnboundedReceiver<Arc<Clip>>,
    sink: Arc<dyn ClipSink>,
    db: Option<Database>,
    last_session_id: Arc<StdMutex<Option<String>>>,
) {
    while let Some(clip) = clips_rx.recv().await {
        if let Some(db) = &db {
            let record = RecordingRecord {
                session_id: last_session_id
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone(),
                created_at: clip.created_at,
                mime_type: clip.mime_type.clone(),
                filename: clip.filename.clone(),
                size_bytes: clip.size_bytes() as u64,
                duration_secs: u64::from(clip.duration_seconds),
            };
            if let Err(err) = db.record_clip(&record).await {
                error!("Failed to record clip {}: {err:#}", clip.filename);
            }
        }

        let sink = Arc::clone(&sink);
        if let Err(err) = tokio::task::spawn_blocking(move || sink.accept(clip)).await {
            error!("Clip sink panicked: {err}");
        }
    }
}

/// Persists one alarm event per increase of the detection counter.
async fn record_alarms(
    db: Database,
    session_id: String,
    mut alarm_rx: watch::Receiver<AlarmSnapshot>,
    cancel_token: CancellationToken,
) {
    let mut recorded = alarm_rx.borrow_and_update().detection_count;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            changed = alarm_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let count = alarm_rx.borrow_and_update().detection_count;
                while recorded < count {
                    recorded += 1;
                    let event = AlarmEvent {
                        session_id: session_id.clone(),
                        triggered_at: Utc::now(),
                        detection_number: recorded,
                    };
                    if let Err(err) = db.record_alarm(&event).await {
                        warn!("Failed to record alarm #{recorded}: {err:#}");
                    }
                }
            }
        }
    }
}
