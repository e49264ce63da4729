use std::{sync::Arc, time::Duration};

use super::{CameraBackend, CameraConfig, CameraError, StreamHandle};

// Set to false to silence camera acquisition logs
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Acquires and releases camera streams. Holds no stream itself: every
/// acquired [`StreamHandle`] is owned by the caller until passed back to
/// [`CameraStreamManager::stop`].
pub struct CameraStreamManager {
    backend: Arc<dyn CameraBackend>,
    settle_delay: Duration,
}

impl CameraStreamManager {
    pub fn new(backend: Arc<dyn CameraBackend>, settle_delay: Duration) -> Self {
        Self {
            backend,
            settle_delay,
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    /// Requests a stream matching `config`. Failures are mapped onto
    /// [`CameraErrorKind`](super::CameraErrorKind); nothing is retried here.
    pub async fn start(&self, config: &CameraConfig) -> Result<StreamHandle, CameraError> {
        match self.backend.request_stream(config).await {
            Ok(stream) => {
                let handle = StreamHandle::new(*config, stream);
                log_info!(
                    "camera started ({} facing, requested {}x{})",
                    config.facing.as_constraint(),
                    config.requested_width,
                    config.requested_height
                );
                Ok(handle)
            }
            Err(platform_err) => {
                let err = CameraError::from(&platform_err);
                log_warn!(
                    "camera start failed: {platform_err} -> {:?}",
                    err.kind
                );
                Err(err)
            }
        }
    }

    /// Stops every hardware track behind the handle.
    pub fn stop(&self, handle: StreamHandle) {
        handle.release();
        log_info!("camera stream {} released", handle.id());
    }

    /// Releases the current stream, flips facing and reacquires after the
    /// settle delay so the platform finishes tearing down the old device.
    pub async fn switch_facing(&self, handle: StreamHandle) -> Result<StreamHandle, CameraError> {
        let config = handle.config();
        let next = config.with_facing(config.facing.flipped());

        self.stop(handle);
        tokio::time::sleep(self.settle_delay).await;

        log_info!("switching camera to {} facing", next.facing.as_constraint());
        self.start(&next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraErrorKind, Facing, SyntheticCamera};

    fn config() -> CameraConfig {
        CameraConfig {
            facing: Facing::Back,
            requested_width: 32,
            requested_height: 24,
        }
    }

    fn manager(camera: Arc<SyntheticCamera>) -> CameraStreamManager {
        CameraStreamManager::new(camera, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn permission_denied_then_retry_with_same_config() {
        let camera = Arc::new(SyntheticCamera::new());
        camera.fail_next("NotAllowedError");
        let manager = manager(camera.clone());

        let err = manager.start(&config()).await.unwrap_err();
        assert_eq!(err.kind, CameraErrorKind::PermissionDenied);

        let handle = manager.start(&config()).await.unwrap();
        assert_eq!(handle.config(), config());
        assert_eq!(camera.requests(), vec![config(), config()]);
    }

    #[tokio::test]
    async fn stop_releases_every_track() {
        let camera = Arc::new(SyntheticCamera::new());
        let manager = manager(camera.clone());

        let handle = manager.start(&config()).await.unwrap();
        assert_eq!(camera.live_track_count(), 1);

        manager.stop(handle);
        assert_eq!(camera.live_track_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn switch_flips_facing_after_settle_delay() {
        let camera = Arc::new(SyntheticCamera::new());
        let manager = manager(camera.clone());
        let handle = manager.start(&config()).await.unwrap();

        let started = tokio::time::Instant::now();
        let switched = manager.switch_facing(handle).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(switched.config().facing, Facing::Front);
        assert_eq!(camera.live_track_count(), 1);
        assert_eq!(camera.issued_track_count(), 2);
    }
}
