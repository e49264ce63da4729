pub mod alarm;
pub mod camera;
pub mod commands;
pub mod db;
pub mod detection;
pub mod export;
pub mod metrics;
pub mod overlay;
pub mod pipeline;
pub mod recording;
pub mod settings;
pub mod utils;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};

use camera::{CameraBackend, SyntheticCamera};
use db::Database;
use detection::{http::HttpDetectorLoader, DetectorLoader, PlatformCapabilities};
use export::ClipExporter;
use pipeline::{PipelineController, PipelineParts, PipelineStatus};
use recording::FfmpegEncoder;
use settings::SettingsStore;

pub fn run() -> Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Phone Lunk starting up...");

    let settings_store = SettingsStore::from_env()?;
    let settings = settings_store.current();

    let database = match Database::new(Database::default_path()) {
        Ok(database) => Some(database),
        Err(err) => {
            error!("Stats disabled, database unavailable: {err:#}");
            None
        }
    };

    let encoder = FfmpegEncoder::detect("ffmpeg");
    if encoder.supported_types().is_empty() {
        warn!("ffmpeg not found; recording is disabled");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async move {
        // Close sessions that were still open when the app last crashed.
        if let Some(db) = &database {
            match db.mark_orphaned_sessions().await {
                Ok(0) => {}
                Ok(count) => warn!("Closed {count} detection session(s) left open by a crash"),
                Err(err) => error!("Failed to recover orphaned sessions: {err:#}"),
            }
        }

        let camera = Arc::new(SyntheticCamera::new());
        let loader = Arc::new(HttpDetectorLoader::new(
            settings.detection.detector_endpoint.clone(),
            settings.detection.detector_timeout(),
        ));
        let capabilities = PlatformCapabilities {
            camera_access: camera.is_available(),
            accelerated_rendering: loader.supports_acceleration(),
        };

        let pipeline = PipelineController::new(
            settings.clone(),
            PipelineParts {
                camera,
                loader,
                encoder: Arc::new(encoder),
                sink: Arc::new(ClipExporter::new(settings.recording.output_dir.clone())),
                db: database,
            },
        );
        pipeline.set_alarm_callback(Arc::new(|| info!("🚨 Phone lunk detected")));

        match pipeline.initialize(capabilities).await {
            PipelineStatus::Incompatible => {
                error!("This platform cannot run detection (no camera or acceleration)");
                return Ok(());
            }
            status => info!("Pipeline ready: {status:?}"),
        }

        commands::run_repl(pipeline, &settings_store).await
    })
}
