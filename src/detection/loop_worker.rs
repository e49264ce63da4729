use std::{future::Future, pin::Pin, sync::Arc};

use anyhow::anyhow;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    alarm::AlarmController,
    camera::{Frame, StreamHandle},
    metrics::{MetricsCollector, PollMetrics},
    overlay::{draw_predictions, ImageSurface},
};

use super::{DetectionFilter, DetectionSnapshot, DetectorHandle, Prediction};

// Set to false to silence per-poll logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

type PendingPoll = Pin<Box<dyn Future<Output = PollOutcome> + Send>>;

/// Everything one run of the poll loop needs. Built fresh for every camera
/// session.
pub struct PollContext {
    pub stream: StreamHandle,
    pub detector: DetectorHandle,
    pub filter: DetectionFilter,
    pub alarm: AlarmController,
    pub snapshots: Arc<watch::Sender<DetectionSnapshot>>,
    pub metrics: MetricsCollector,
    pub poll_interval: Duration,
    /// Upper bound on a single detector call; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

struct PollOutcome {
    sequence: u64,
    width: u32,
    height: u32,
    predictions: Vec<Prediction>,
    inference_ms: u64,
    failed: bool,
}

/// Fixed-period poll loop with at most one detector call outstanding.
///
/// A tick that fires while the previous call is still running is skipped,
/// not queued. Once `cancel_token` fires, the outstanding call is dropped
/// and no result is applied.
pub async fn detection_loop(ctx: PollContext, cancel_token: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut in_flight: Option<PendingPoll> = None;
    let mut surface = ImageSurface::new(0, 0);

    log_info!(
        "detection loop started (every {}ms, class '{}' > {:.2})",
        ctx.poll_interval.as_millis(),
        ctx.filter.target_class,
        ctx.filter.threshold
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                log_info!("detection loop shutting down");
                break;
            }
            outcome = wait_pending(&mut in_flight), if in_flight.is_some() => {
                in_flight = None;
                if cancel_token.is_cancelled() {
                    break;
                }
                apply_outcome(&ctx, &mut surface, outcome).await;
            }
            _ = ticker.tick() => {
                if in_flight.is_some() {
                    log_debug!("poll still outstanding; skipping tick");
                    ctx.metrics.record_skipped_tick().await;
                    continue;
                }

                let Some(frame) = ctx.stream.current_frame() else {
                    log_debug!("no frame available yet; skipping tick");
                    continue;
                };

                in_flight = Some(Box::pin(run_poll(ctx.detector.clone(), frame, ctx.timeout)));
            }
        }
    }
}

async fn wait_pending(slot: &mut Option<PendingPoll>) -> PollOutcome {
    match slot.as_mut() {
        Some(pending) => pending.await,
        None => std::future::pending().await,
    }
}

async fn run_poll(detector: DetectorHandle, frame: Frame, timeout: Option<Duration>) -> PollOutcome {
    let started = Instant::now();

    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, detector.detect(&frame)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("detector did not respond within {}ms", limit.as_millis())),
        },
        None => detector.detect(&frame).await,
    };

    let inference_ms = started.elapsed().as_millis() as u64;
    let (predictions, failed) = match result {
        Ok(predictions) => (predictions, false),
        Err(err) => {
            log_warn!("detector poll failed: {err:#}");
            (Vec::new(), true)
        }
    };

    PollOutcome {
        sequence: frame.sequence,
        width: frame.width(),
        height: frame.height(),
        predictions,
        inference_ms,
        failed,
    }
}

/// Draw, then alarm, then publish: readers of the snapshot always see an
/// alarm phase that already reflects these matches.
async fn apply_outcome(ctx: &PollContext, surface: &mut ImageSurface, outcome: PollOutcome) {
    let matches = ctx.filter.apply(&outcome.predictions);

    surface.ensure_size(outcome.width, outcome.height);
    draw_predictions(surface, &matches);

    ctx.alarm.observe(!matches.is_empty());

    let match_count = matches.len();
    ctx.snapshots.send_replace(DetectionSnapshot {
        sequence: outcome.sequence,
        matches: Arc::new(matches),
        overlay: Some(Arc::new(surface.image().clone())),
    });

    ctx.metrics
        .record_poll(PollMetrics {
            timestamp: Utc::now(),
            inference_ms: outcome.inference_ms,
            prediction_count: outcome.predictions.len(),
            match_count,
            failed: outcome.failed,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{AlarmPhase, AlarmTimings};
    use crate::camera::{CameraConfig, CameraStreamManager, Facing, SyntheticCamera};
    use crate::detection::testing::prediction;
    use crate::detection::Detector;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowDetector {
        delay: Duration,
        calls: Arc<AtomicUsize>,
        label: &'static str,
    }

    #[async_trait]
    impl Detector for SlowDetector {
        async fn detect(&self, _frame: &Frame) -> anyhow::Result<Vec<Prediction>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(vec![prediction(self.label, 0.9)])
        }
    }

    struct FailingDetector;

    #[async_trait]
    impl Detector for FailingDetector {
        async fn detect(&self, _frame: &Frame) -> anyhow::Result<Vec<Prediction>> {
            Err(anyhow!("inference backend crashed"))
        }
    }

    async fn context(detector: DetectorHandle, timeout: Option<Duration>) -> (PollContext, watch::Receiver<DetectionSnapshot>) {
        let camera = Arc::new(SyntheticCamera::new());
        let manager = CameraStreamManager::new(camera, Duration::from_millis(100));
        let stream = manager
            .start(&CameraConfig {
                facing: Facing::Back,
                requested_width: 64,
                requested_height: 48,
            })
            .await
            .unwrap();

        let alarm = AlarmController::new(AlarmTimings::default());
        alarm.arm();
        let (snapshots, rx) = watch::channel(DetectionSnapshot::default());

        (
            PollContext {
                stream,
                detector,
                filter: DetectionFilter::default(),
                alarm,
                snapshots: Arc::new(snapshots),
                metrics: MetricsCollector::new(),
                poll_interval: Duration::from_millis(100),
                timeout,
            },
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn slow_detector_never_overlaps() {
        let calls = Arc::new(AtomicUsize::new(0));
        let detector = Arc::new(SlowDetector {
            delay: Duration::from_millis(350),
            calls: calls.clone(),
            label: "person",
        });
        let (ctx, _rx) = context(detector, None).await;
        let metrics = ctx.metrics.clone();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(detection_loop(ctx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        cancel.cancel();
        handle.await.unwrap();

        // polls start at 0, 400 and 800ms; the ticks in between are skipped
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let snapshot = metrics.get_snapshot().await;
        assert_eq!(snapshot.poll_count, 2);
        assert!(snapshot.skipped_ticks >= 6);
    }

    #[tokio::test(start_paused = true)]
    async fn match_draws_overlay_and_alarms() {
        let calls = Arc::new(AtomicUsize::new(0));
        let detector = Arc::new(SlowDetector {
            delay: Duration::from_millis(10),
            calls,
            label: "cell phone",
        });
        let (ctx, mut rx) = context(detector, None).await;
        let alarm = ctx.alarm.clone();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(detection_loop(ctx, cancel.clone()));

        rx.changed().await.unwrap();
        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.matches.len(), 1);
        let overlay = snapshot.overlay.unwrap();
        assert_eq!(overlay.dimensions(), (64, 48));
        assert!(overlay.pixels().any(|p| p[3] > 0));
        assert_eq!(alarm.phase(), AlarmPhase::Alarming);
        assert_eq!(alarm.snapshot().detection_count, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_counts_and_loop_continues() {
        let (ctx, _rx) = context(Arc::new(FailingDetector), None).await;
        let metrics = ctx.metrics.clone();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(detection_loop(ctx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(450)).await;
        cancel.cancel();
        handle.await.unwrap();

        let snapshot = metrics.get_snapshot().await;
        assert!(snapshot.failed_polls >= 4);
        assert_eq!(snapshot.failed_polls, snapshot.poll_count);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_releases_stuck_poll() {
        let calls = Arc::new(AtomicUsize::new(0));
        let detector = Arc::new(SlowDetector {
            delay: Duration::from_secs(3600),
            calls: calls.clone(),
            label: "cell phone",
        });
        let (ctx, _rx) = context(detector, Some(Duration::from_millis(250))).await;
        let metrics = ctx.metrics.clone();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(detection_loop(ctx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert!(metrics.get_snapshot().await.failed_polls >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_loop_stops_polling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let detector = Arc::new(SlowDetector {
            delay: Duration::from_millis(10),
            calls: calls.clone(),
            label: "person",
        });
        let (ctx, _rx) = context(detector, None).await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(detection_loop(ctx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        handle.await.unwrap();
        let after_stop = calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
    }
}
