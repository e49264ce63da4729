use anyhow::{bail, Context, Result};
use log::info;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::loop_worker::{detection_loop, PollContext};

/// Start/stop handle for the background poll loop.
pub struct DetectionController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl DetectionController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    pub fn start(&mut self, ctx: PollContext) -> Result<()> {
        if self.is_active() {
            bail!("detection already active");
        }
        self.handle = None;

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(detection_loop(ctx, cancel_token.clone()));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    /// Signals the loop without waiting. No poll result is applied after
    /// this returns.
    pub fn cancel(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
            info!("Cancel signal sent to detection loop");
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.cancel();

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("detection loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

impl Default for DetectionController {
    fn default() -> Self {
        Self::new()
    }
}
