use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use super::{DetectorHandle, DetectorLoader, ModelState};

pub const MODEL_LOAD_FAILED_MESSAGE: &str = "Failed to load AI model. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformCapabilities {
    pub camera_access: bool,
    pub accelerated_rendering: bool,
}

impl PlatformCapabilities {
    pub fn is_compatible(&self) -> bool {
        self.camera_access && self.accelerated_rendering
    }
}

/// Owns the detector lifecycle: uninitialized → loading → ready/failed.
///
/// A successful load is cached for the life of the controller; failed loads
/// can be retried by calling [`ModelController::load_model`] again.
pub struct ModelController {
    loader: Arc<dyn DetectorLoader>,
    detector: Mutex<Option<DetectorHandle>>,
    load_lock: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<ModelState>,
}

impl ModelController {
    pub fn new(loader: Arc<dyn DetectorLoader>) -> Self {
        let (state_tx, _) = watch::channel(ModelState::Uninitialized);
        Self {
            loader,
            detector: Mutex::new(None),
            load_lock: tokio::sync::Mutex::new(()),
            state_tx,
        }
    }

    pub fn state(&self) -> ModelState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ModelState> {
        self.state_tx.subscribe()
    }

    pub fn detector(&self) -> Option<DetectorHandle> {
        self.detector
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn loader_accelerated(&self) -> bool {
        self.loader.supports_acceleration()
    }

    /// Loads the detector unless already loaded. Concurrent callers queue
    /// behind one load and observe its outcome.
    pub async fn load_model(&self, capabilities: PlatformCapabilities) -> ModelState {
        let _guard = self.load_lock.lock().await;

        match self.state() {
            ModelState::Ready => return ModelState::Ready,
            ModelState::Incompatible => return ModelState::Incompatible,
            _ => {}
        }

        if !capabilities.is_compatible() {
            log::warn!(
                "platform incompatible (camera_access={}, accelerated_rendering={}); skipping model load",
                capabilities.camera_access,
                capabilities.accelerated_rendering
            );
            self.state_tx.send_replace(ModelState::Incompatible);
            return ModelState::Incompatible;
        }

        self.state_tx.send_replace(ModelState::Loading);
        log::info!("Loading detection model...");

        let next = match self.loader.load().await {
            Ok(detector) => {
                *self.detector.lock().unwrap_or_else(|p| p.into_inner()) = Some(detector);
                log::info!("Detection model loaded");
                ModelState::Ready
            }
            Err(err) => {
                log::error!("Error loading detection model: {err:#}");
                ModelState::Failed(MODEL_LOAD_FAILED_MESSAGE.to_string())
            }
        };

        self.state_tx.send_replace(next.clone());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Frame;
    use crate::detection::{Detector, Prediction};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullDetector;

    #[async_trait]
    impl Detector for NullDetector {
        async fn detect(&self, _frame: &Frame) -> anyhow::Result<Vec<Prediction>> {
            Ok(Vec::new())
        }
    }

    /// Fails the first `failures` loads, then succeeds.
    struct FlakyLoader {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DetectorLoader for FlakyLoader {
        async fn load(&self) -> anyhow::Result<DetectorHandle> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(anyhow!("weights unavailable"))
            } else {
                Ok(Arc::new(NullDetector))
            }
        }
    }

    const CAPABLE: PlatformCapabilities = PlatformCapabilities {
        camera_access: true,
        accelerated_rendering: true,
    };

    #[tokio::test]
    async fn load_is_cached_after_success() {
        let loader = Arc::new(FlakyLoader {
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let controller = ModelController::new(loader.clone());

        assert_eq!(controller.state(), ModelState::Uninitialized);
        assert_eq!(controller.load_model(CAPABLE).await, ModelState::Ready);
        assert_eq!(controller.load_model(CAPABLE).await, ModelState::Ready);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert!(controller.detector().is_some());
    }

    #[tokio::test]
    async fn failed_load_can_be_retried() {
        let loader = Arc::new(FlakyLoader {
            failures: 1,
            calls: AtomicUsize::new(0),
        });
        let controller = ModelController::new(loader.clone());

        assert_eq!(
            controller.load_model(CAPABLE).await,
            ModelState::Failed(MODEL_LOAD_FAILED_MESSAGE.into())
        );
        assert!(controller.detector().is_none());

        assert_eq!(controller.load_model(CAPABLE).await, ModelState::Ready);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn incompatible_platform_never_loads() {
        let loader = Arc::new(FlakyLoader {
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let controller = ModelController::new(loader.clone());
        let caps = PlatformCapabilities {
            camera_access: true,
            accelerated_rendering: false,
        };

        assert_eq!(controller.load_model(caps).await, ModelState::Incompatible);
        assert_eq!(controller.load_model(CAPABLE).await, ModelState::Incompatible);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
    }
}
