//! skytrackd - bright-spot camera tracker daemon
//!
//! Startup order matters: camera and servo daemon first (failures here are
//! fatal; the process must not come up half-initialized), then the tracker
//! loop, then the HTTP surface. Shutdown is the reverse, driven by SIGINT:
//! stop accepting requests, join the tracker, release the camera exactly
//! once, park the servos.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use skytrack::api::{ApiConfig, ApiServer, AppState};
use skytrack::config::SkytrackdConfig;
use skytrack::{
    CameraConfig, CameraSource, FrameCache, ServoConfig, ServoController, SharedCoordinate,
    Tracker,
};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about = "Bright-spot camera tracker with MJPEG streaming and servo control")]
struct Args {
    /// Config file path (overrides SKYTRACK_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP bind address (overrides the configured value).
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = SkytrackdConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        cfg.http_addr = addr;
    }

    let camera = Arc::new(CameraSource::new(CameraConfig {
        device: cfg.camera.device.clone(),
        width: cfg.camera.width,
        height: cfg.camera.height,
        target_fps: cfg.camera.target_fps,
        warmup_ms: cfg.camera.warmup_ms,
    })?);
    camera.start().context("start camera")?;

    let servo = Arc::new(
        ServoController::connect(&ServoConfig {
            daemon_addr: cfg.servo_daemon_addr.clone(),
        })
        .context("connect servo controller")?,
    );

    let cache = Arc::new(FrameCache::new());
    let coordinate = Arc::new(SharedCoordinate::new());

    let tracker_handle = Tracker::new(cache.clone(), coordinate.clone())
        .with_interval(cfg.track_interval)
        .spawn();

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.http_addr.clone(),
            username: cfg.auth.username.clone(),
            password: cfg.auth.password.clone(),
            stream_interval: cfg.stream_interval,
            jpeg_quality: cfg.jpeg_quality,
        },
        AppState {
            camera: camera.clone(),
            cache,
            coordinate,
            servo: servo.clone(),
        },
    )
    .spawn()?;

    log::info!("skytrackd listening on {}", api_handle.addr);
    log::info!(
        "camera={} servo_daemon={}",
        cfg.camera.device,
        cfg.servo_daemon_addr
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_handler.store(true, Ordering::SeqCst);
    })
    .context("install signal handler")?;

    let mut last_health_log = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            let stats = camera.stats();
            log::info!(
                "camera health={} frames={} device={}",
                camera.is_healthy(),
                stats.frames_captured,
                stats.device
            );
            last_health_log = Instant::now();
        }
    }

    log::info!("shutting down");
    api_handle.stop()?;
    tracker_handle.stop()?;
    camera.stop();
    if let Err(err) = servo.shutdown() {
        log::warn!("servo shutdown failed: {}", err);
    }
    Ok(())
}
