use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;

use bytes::Bytes;
use image::RgbaImage;
use tokio::sync::watch;

use phonelunk_lib::{
    alarm::{AlarmPhase, AlarmSnapshot},
    camera::{
        CameraBackend, CameraConfig, CameraErrorKind, Facing, Frame, MediaStream, PlatformError,
        SyntheticCamera,
    },
    db::Database,
    detection::{
        model::MODEL_LOAD_FAILED_MESSAGE, BoundingBox, Detector, DetectorHandle, DetectorLoader,
        PlatformCapabilities, Prediction,
    },
    export::ClipSink,
    pipeline::{PipelineController, PipelineParts, PipelineStatus, RetryAction},
    recording::{
        Clip, EncoderBackend, EncodingSession, MemoryEncoder, RecordingError, RecordingPhase,
    },
    settings::PipelineSettings,
};

#[derive(Default)]
struct ScriptedDetector {
    phone_in_view: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl Detector for ScriptedDetector {
    async fn detect(&self, _frame: &Frame) -> anyhow::Result<Vec<Prediction>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.phone_in_view.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(vec![Prediction {
            label: "cell phone".into(),
            score: 0.91,
            bbox: BoundingBox {
                x: 4.0,
                y: 4.0,
                width: 20.0,
                height: 16.0,
            },
        }])
    }
}

struct ScriptedLoader {
    detector: Arc<ScriptedDetector>,
    failures_left: AtomicUsize,
}

#[async_trait]
impl DetectorLoader for ScriptedLoader {
    async fn load(&self) -> anyhow::Result<DetectorHandle> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("weights unavailable"));
        }
        Ok(self.detector.clone())
    }
}

#[derive(Default)]
struct CollectingSink {
    clips: Mutex<Vec<Arc<Clip>>>,
}

impl CollectingSink {
    fn count(&self) -> usize {
        self.clips.lock().unwrap().len()
    }
}

impl ClipSink for CollectingSink {
    fn accept(&self, clip: Arc<Clip>) {
        self.clips.lock().unwrap().push(clip);
    }
}

/// Notes the alarm phase each time a stream is requested.
struct PhaseNotingCamera {
    inner: Arc<SyntheticCamera>,
    alarm: Mutex<Option<watch::Receiver<AlarmSnapshot>>>,
    phases: Mutex<Vec<AlarmPhase>>,
}

#[async_trait]
impl CameraBackend for PhaseNotingCamera {
    async fn request_stream(
        &self,
        config: &CameraConfig,
    ) -> Result<Arc<dyn MediaStream>, PlatformError> {
        if let Some(alarm) = self.alarm.lock().unwrap().as_ref() {
            self.phases.lock().unwrap().push(alarm.borrow().phase);
        }
        self.inner.request_stream(config).await
    }
}

/// Notes how many camera tracks are live when a recording is finalized.
struct TrackCountingEncoder {
    inner: MemoryEncoder,
    camera: Arc<SyntheticCamera>,
    live_at_finish: Arc<Mutex<Vec<usize>>>,
}

struct TrackCountingSession {
    inner: Box<dyn EncodingSession>,
    camera: Arc<SyntheticCamera>,
    live_at_finish: Arc<Mutex<Vec<usize>>>,
}

impl EncoderBackend for TrackCountingEncoder {
    fn is_type_supported(&self, mime_type: &str) -> bool {
        self.inner.is_type_supported(mime_type)
    }

    fn open(
        &self,
        mime_type: &str,
        width: u32,
        height: u32,
        fps: u32,
    ) -> anyhow::Result<Box<dyn EncodingSession>> {
        Ok(Box::new(TrackCountingSession {
            inner: self.inner.open(mime_type, width, height, fps)?,
            camera: self.camera.clone(),
            live_at_finish: self.live_at_finish.clone(),
        }))
    }
}

impl EncodingSession for TrackCountingSession {
    fn mime_type(&self) -> &str {
        self.inner.mime_type()
    }

    fn push_frame(&mut self, frame: &RgbaImage) -> anyhow::Result<()> {
        self.inner.push_frame(frame)
    }

    fn drain_chunks(&mut self) -> Vec<Bytes> {
        self.inner.drain_chunks()
    }

    fn finish(self: Box<Self>) -> anyhow::Result<Vec<Bytes>> {
        self.live_at_finish
            .lock()
            .unwrap()
            .push(self.camera.live_track_count());
        self.inner.finish()
    }
}

const CAPABLE: PlatformCapabilities = PlatformCapabilities {
    camera_access: true,
    accelerated_rendering: true,
};

struct Rig {
    pipeline: PipelineController,
    camera: Arc<SyntheticCamera>,
    detector: Arc<ScriptedDetector>,
    sink: Arc<CollectingSink>,
}

fn settings() -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    settings.camera.requested_width = 64;
    settings.camera.requested_height = 48;
    settings.recording.banner_height = 12;
    settings.recording.refresh_rate_hz = 30;
    settings
}

fn rig_with(load_failures: usize, db: Option<Database>) -> Rig {
    let camera = Arc::new(SyntheticCamera::new());
    build_rig(
        load_failures,
        db,
        camera.clone(),
        camera,
        Arc::new(MemoryEncoder::all()),
    )
}

fn build_rig(
    load_failures: usize,
    db: Option<Database>,
    camera: Arc<SyntheticCamera>,
    backend: Arc<dyn CameraBackend>,
    encoder: Arc<dyn EncoderBackend>,
) -> Rig {
    let detector = Arc::new(ScriptedDetector::default());
    let sink = Arc::new(CollectingSink::default());
    let loader = Arc::new(ScriptedLoader {
        detector: detector.clone(),
        failures_left: AtomicUsize::new(load_failures),
    });

    let pipeline = PipelineController::new(
        settings(),
        PipelineParts {
            camera: backend,
            loader,
            encoder,
            sink: sink.clone(),
            db,
        },
    );

    Rig {
        pipeline,
        camera,
        detector,
        sink,
    }
}

async fn monitoring_rig() -> Rig {
    start_monitoring(rig_with(0, None)).await
}

async fn start_monitoring(rig: Rig) -> Rig {
    assert_eq!(rig.pipeline.initialize(CAPABLE).await, PipelineStatus::CameraOff);
    assert_eq!(
        rig.pipeline.start_camera().await.unwrap(),
        PipelineStatus::Monitoring
    );
    rig
}

async fn wait_for_clips(sink: &CollectingSink, expected: usize) {
    for _ in 0..50 {
        if sink.count() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn stopping_camera_stops_polls_and_releases_tracks() {
    let rig = monitoring_rig().await;

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(rig.detector.calls.load(Ordering::SeqCst) >= 3);
    assert_eq!(rig.camera.live_track_count(), 1);

    rig.pipeline.stop_camera().await.unwrap();
    let calls_at_stop = rig.detector.calls.load(Ordering::SeqCst);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(rig.detector.calls.load(Ordering::SeqCst), calls_at_stop);
    assert_eq!(rig.camera.live_track_count(), 0);
    assert_eq!(rig.pipeline.status(), PipelineStatus::CameraOff);
    assert!(rig.pipeline.subscribe_detections().borrow().matches.is_empty());
}

#[tokio::test(start_paused = true)]
async fn matches_raise_one_alarm_per_cooldown_window() {
    let rig = monitoring_rig().await;
    let alarms = Arc::new(AtomicUsize::new(0));
    let counter = alarms.clone();
    rig.pipeline.set_alarm_callback(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    rig.detector.phone_in_view.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(250)).await;

    let snapshot = rig.pipeline.alarm_snapshot();
    assert_eq!(snapshot.phase, AlarmPhase::Alarming);
    assert_eq!(snapshot.detection_count, 1);
    assert_eq!(alarms.load(Ordering::SeqCst), 1);

    let detections = rig.pipeline.subscribe_detections().borrow().clone();
    assert_eq!(detections.matches.len(), 1);
    assert!(detections.overlay.is_some());

    rig.pipeline.stop_camera().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn switching_facing_forces_idle_and_keeps_count() {
    let rig = monitoring_rig().await;
    rig.detector.phone_in_view.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(rig.pipeline.alarm_snapshot().phase, AlarmPhase::Alarming);

    let status = rig.pipeline.switch_facing().await.unwrap();

    assert_eq!(status, PipelineStatus::Monitoring);
    let snapshot = rig.pipeline.alarm_snapshot();
    assert_eq!(snapshot.phase, AlarmPhase::Idle);
    assert_eq!(snapshot.detection_count, 1);

    let requests = rig.camera.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].facing, Facing::Back);
    assert_eq!(requests[1].facing, Facing::Front);
    assert_eq!(rig.camera.live_track_count(), 1);
    assert_eq!(rig.pipeline.camera_config().await.facing, Facing::Front);

    rig.pipeline.stop_camera().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn switch_requests_new_stream_only_after_alarm_is_idle() {
    let camera = Arc::new(SyntheticCamera::new());
    let backend = Arc::new(PhaseNotingCamera {
        inner: camera.clone(),
        alarm: Mutex::new(None),
        phases: Mutex::new(Vec::new()),
    });
    let rig = build_rig(
        0,
        None,
        camera,
        backend.clone(),
        Arc::new(MemoryEncoder::all()),
    );
    *backend.alarm.lock().unwrap() = Some(rig.pipeline.subscribe_alarm());
    let rig = start_monitoring(rig).await;

    rig.detector.phone_in_view.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(rig.pipeline.alarm_snapshot().phase, AlarmPhase::Alarming);

    rig.pipeline.switch_facing().await.unwrap();

    assert_eq!(
        *backend.phases.lock().unwrap(),
        vec![AlarmPhase::Idle, AlarmPhase::Idle]
    );
    rig.pipeline.stop_camera().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn denied_camera_is_retried_with_same_config() {
    let rig = rig_with(0, None);
    rig.pipeline.initialize(CAPABLE).await;
    rig.camera.fail_next("NotAllowedError");

    let status = rig.pipeline.start_camera().await.unwrap();
    match &status {
        PipelineStatus::CameraError { kind, .. } => {
            assert_eq!(*kind, CameraErrorKind::PermissionDenied)
        }
        other => panic!("expected camera error, got {other:?}"),
    }
    assert_eq!(status.retry_action(), Some(RetryAction::RestartCamera));

    assert_eq!(rig.pipeline.retry().await.unwrap(), PipelineStatus::Monitoring);
    let requests = rig.camera.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], requests[1]);

    rig.pipeline.stop_camera().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_model_load_offers_reload() {
    let rig = rig_with(1, None);

    let status = rig.pipeline.initialize(CAPABLE).await;
    assert_eq!(
        status,
        PipelineStatus::ModelLoadFailed {
            message: MODEL_LOAD_FAILED_MESSAGE.to_string()
        }
    );
    assert_eq!(status.retry_action(), Some(RetryAction::ReloadModel));
    assert!(rig.pipeline.start_camera().await.is_err());

    assert_eq!(rig.pipeline.retry().await.unwrap(), PipelineStatus::CameraOff);
}

#[tokio::test(start_paused = true)]
async fn incompatible_platform_never_loads() {
    let rig = rig_with(0, None);
    let status = rig
        .pipeline
        .initialize(PlatformCapabilities {
            camera_access: true,
            accelerated_rendering: false,
        })
        .await;

    assert_eq!(status, PipelineStatus::Incompatible);
    assert_eq!(status.retry_action(), None);
    assert!(rig.pipeline.start_camera().await.is_err());
    assert!(rig.camera.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_recording_is_rejected_and_first_survives() {
    let rig = monitoring_rig().await;

    rig.pipeline.start_recording().await.unwrap();
    assert_eq!(
        rig.pipeline.start_recording().await.unwrap_err(),
        RecordingError::AlreadyRecording
    );

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(rig.pipeline.recording_status().is_recording());

    let clip = rig.pipeline.stop_recording().await.unwrap();
    assert!(!clip.is_empty());
    assert!(clip.frame_count > 0);

    wait_for_clips(&rig.sink, 1).await;
    assert_eq!(rig.sink.count(), 1);

    rig.pipeline.stop_camera().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stopping_camera_finalizes_open_recording_first() {
    let rig = monitoring_rig().await;
    rig.pipeline.start_recording().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    rig.pipeline.stop_camera().await.unwrap();

    assert!(matches!(
        rig.pipeline.recording_status().phase,
        RecordingPhase::Ready(_)
    ));
    assert_eq!(rig.camera.live_track_count(), 0);
    assert_eq!(
        rig.pipeline.stop_recording().await.unwrap_err(),
        RecordingError::NotActive
    );

    wait_for_clips(&rig.sink, 1).await;
    assert_eq!(rig.sink.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn recording_is_finalized_while_camera_track_is_live() {
    let camera = Arc::new(SyntheticCamera::new());
    let live_at_finish = Arc::new(Mutex::new(Vec::new()));
    let encoder = Arc::new(TrackCountingEncoder {
        inner: MemoryEncoder::all(),
        camera: camera.clone(),
        live_at_finish: live_at_finish.clone(),
    });
    let rig = start_monitoring(build_rig(0, None, camera.clone(), camera, encoder)).await;

    rig.pipeline.start_recording().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    rig.pipeline.stop_camera().await.unwrap();

    assert_eq!(*live_at_finish.lock().unwrap(), vec![1]);
    assert_eq!(rig.camera.live_track_count(), 0);
}

#[tokio::test]
async fn camera_sessions_and_alarms_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new(dir.path().join("stats.sqlite3")).unwrap();
    let rig = rig_with(0, Some(db.clone()));
    rig.pipeline.initialize(CAPABLE).await;
    rig.pipeline.start_camera().await.unwrap();

    let mut alarm_rx = rig.pipeline.subscribe_alarm();
    rig.detector.phone_in_view.store(true, Ordering::SeqCst);
    tokio::time::timeout(
        Duration::from_secs(5),
        alarm_rx.wait_for(|snapshot| snapshot.detection_count == 1),
    )
    .await
    .unwrap()
    .unwrap();

    rig.pipeline.stop_camera().await.unwrap();

    let stats = rig.pipeline.stats().await.unwrap();
    assert_eq!(stats.total_sessions, 1);
    assert_eq!(stats.total_detections, 1);
    assert!(stats.last_session_date.is_some());

    rig.pipeline.clear_stats().await.unwrap();
    assert_eq!(rig.pipeline.stats().await.unwrap().total_sessions, 0);
}
