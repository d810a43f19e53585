//! posewatchd - multi-camera pose monitoring daemon
//!
//! This daemon:
//! 1. Opens the detection database (aborts if it cannot)
//! 2. Starts one streamer thread per configured camera
//! 3. Serves the read-only query API alongside (unless `--no-api`)
//! 4. On Ctrl-C, stops every camera, drains output and pending writes,
//!    then closes the database

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use posewatch::{
    api::{ApiServer, ApiServerConfig},
    sink::{CountingSinkFactory, FfmpegSinkFactory},
    Backoff, BackendKind, BackendSettings, CameraOutcome, CameraSettings, CameraSupervisor,
    DetectionStore, PoseBackend, PoseEstimator, PoseStreamer, PosewatchdConfig, RtspConfig,
    RtspSource, ShutdownSignal, SinkFactory, StreamerOptions, StubBackend,
};

#[derive(Parser, Debug)]
#[command(name = "posewatchd", about = "Multi-camera pose monitoring daemon")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension)
    #[arg(long, env = "POSEWATCH_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Do not serve the query API from this process
    #[arg(long)]
    no_api: bool,

    /// Discard annotated frames instead of encoding them
    #[arg(long)]
    no_output: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = PosewatchdConfig::load_from(args.config.as_deref())?;
    log::info!(
        "posewatchd {} starting: {} camera(s), {} fps, database {}",
        env!("CARGO_PKG_VERSION"),
        cfg.cameras.len(),
        cfg.fps,
        cfg.db_path
    );

    let store = Arc::new(
        DetectionStore::open(&cfg.db_path, cfg.pool_size)
            .with_context(|| format!("open detection database {}", cfg.db_path))?,
    );
    if !cfg.persist_detections {
        log::warn!("detection persistence disabled; nothing will be written to the database");
    }

    let shutdown = ShutdownSignal::new();
    let mut streamers = Vec::with_capacity(cfg.cameras.len());
    for camera in &cfg.cameras {
        streamers.push(build_streamer(&cfg, camera, &store, &shutdown, args.no_output)?);
    }

    let api_handle = if args.no_api {
        None
    } else {
        Some(
            ApiServer::new(
                ApiServerConfig {
                    addr: cfg.api_addr.clone(),
                },
                store.clone(),
            )
            .spawn()?,
        )
    };

    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            if shutdown.trigger() {
                log::info!("shutdown signal received, stopping cameras...");
            }
        })?;
    }

    let mut supervisor = CameraSupervisor::new(Some(store.clone()), shutdown.clone());
    for streamer in streamers {
        if let Err(err) = supervisor.spawn(streamer) {
            supervisor.stop();
            supervisor.join();
            return Err(err);
        }
    }
    log::info!("posewatchd running; press Ctrl-C to stop");

    let outcomes = supervisor.join();
    if let Some(handle) = api_handle {
        handle.stop()?;
    }
    store.close();

    let panicked: Vec<&str> = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, CameraOutcome::Panicked { .. }))
        .map(CameraOutcome::camera)
        .collect();
    if !panicked.is_empty() {
        return Err(anyhow!("camera thread(s) panicked: {}", panicked.join(", ")));
    }
    log::info!("posewatchd stopped");
    Ok(())
}

fn build_streamer(
    cfg: &PosewatchdConfig,
    camera: &CameraSettings,
    store: &Arc<DetectionStore>,
    shutdown: &ShutdownSignal,
    no_output: bool,
) -> Result<PoseStreamer> {
    let source = RtspSource::open_or_released(RtspConfig {
        url: camera.url.clone(),
        ..RtspConfig::default()
    });
    let backend = build_backend(&cfg.backend)
        .with_context(|| format!("load pose backend for camera {}", camera.name))?;
    let estimator = PoseEstimator::new(backend).with_original(cfg.show_original);
    let sinks: Box<dyn SinkFactory> = if no_output {
        Box::new(CountingSinkFactory::new())
    } else {
        let target = camera.output_target(&cfg.output_dir);
        log::info!("camera {}: writing annotated stream to {}", camera.name, target);
        Box::new(FfmpegSinkFactory::new(target))
    };
    let options = StreamerOptions {
        fps: cfg.fps,
        backoff: Backoff::with_max_delay(cfg.max_backoff),
        ..StreamerOptions::default()
    };

    let streamer = PoseStreamer::new(
        camera.name.clone(),
        Box::new(source),
        estimator,
        sinks,
        shutdown.clone(),
        options,
    )
    .with_address(Some(camera.url.clone()));
    Ok(if cfg.persist_detections {
        streamer.with_store(store.clone())
    } else {
        streamer
    })
}

fn build_backend(settings: &BackendSettings) -> Result<Box<dyn PoseBackend>> {
    match settings.kind {
        BackendKind::Stub => Ok(Box::new(StubBackend::default())),
        BackendKind::Tract => tract_backend(settings),
    }
}

#[cfg(feature = "backend-tract")]
fn tract_backend(settings: &BackendSettings) -> Result<Box<dyn PoseBackend>> {
    let path = settings
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("the tract backend requires model_path"))?;
    Ok(Box::new(posewatch::pose::TractBackend::new(
        path,
        settings.model_input,
    )?))
}

#[cfg(not(feature = "backend-tract"))]
fn tract_backend(_settings: &BackendSettings) -> Result<Box<dyn PoseBackend>> {
    Err(anyhow!(
        "the tract backend requires building with --features backend-tract"
    ))
}
