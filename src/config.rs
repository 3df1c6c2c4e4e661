//! Daemon configuration.
//!
//! Layered like every deployment of this daemon expects: optional JSON config
//! file (path in `SKYTRACK_CONFIG`), then environment overrides, then
//! validation. Admin credentials have no default: the daemon refuses to
//! start without them rather than exposing the admin surface unauthenticated.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_CAMERA_DEVICE: &str = "stub://camera";
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_CAMERA_FPS: u32 = 30;
const DEFAULT_CAMERA_WARMUP_MS: u64 = 2_000;
const DEFAULT_SERVO_DAEMON_ADDR: &str = "127.0.0.1:8888";
const DEFAULT_TRACK_INTERVAL_MS: u64 = 50;
const DEFAULT_STREAM_INTERVAL_MS: u64 = 33;
const DEFAULT_JPEG_QUALITY: u8 = 85;

#[derive(Debug, Deserialize, Default)]
struct SkytrackdConfigFile {
    http: Option<HttpConfigFile>,
    auth: Option<AuthConfigFile>,
    camera: Option<CameraConfigFile>,
    servo: Option<ServoConfigFile>,
    tracker: Option<TrackerConfigFile>,
    stream: Option<StreamConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct HttpConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AuthConfigFile {
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    warmup_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ServoConfigFile {
    daemon_addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    interval_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct SkytrackdConfig {
    pub http_addr: String,
    pub auth: AuthSettings,
    pub camera: CameraSettings,
    pub servo_daemon_addr: String,
    pub track_interval: Duration,
    pub stream_interval: Duration,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub warmup_ms: u64,
}

impl SkytrackdConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load with an explicit config-file path (CLI `--config`), falling back
    /// to `SKYTRACK_CONFIG` when absent.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("SKYTRACK_CONFIG").ok();
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => match env_path.as_deref() {
                Some(path) => Some(read_config_file(Path::new(path))?),
                None => None,
            },
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SkytrackdConfigFile) -> Self {
        let http_addr = file
            .http
            .and_then(|http| http.addr)
            .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string());
        let auth = AuthSettings {
            username: file
                .auth
                .as_ref()
                .and_then(|auth| auth.username.clone())
                .unwrap_or_default(),
            password: file
                .auth
                .and_then(|auth| auth.password)
                .unwrap_or_default(),
        };
        let camera = CameraSettings {
            device: file
                .camera
                .as_ref()
                .and_then(|camera| camera.device.clone())
                .unwrap_or_else(|| DEFAULT_CAMERA_DEVICE.to_string()),
            width: file
                .camera
                .as_ref()
                .and_then(|camera| camera.width)
                .unwrap_or(DEFAULT_CAMERA_WIDTH),
            height: file
                .camera
                .as_ref()
                .and_then(|camera| camera.height)
                .unwrap_or(DEFAULT_CAMERA_HEIGHT),
            target_fps: file
                .camera
                .as_ref()
                .and_then(|camera| camera.target_fps)
                .unwrap_or(DEFAULT_CAMERA_FPS),
            warmup_ms: file
                .camera
                .and_then(|camera| camera.warmup_ms)
                .unwrap_or(DEFAULT_CAMERA_WARMUP_MS),
        };
        let servo_daemon_addr = file
            .servo
            .and_then(|servo| servo.daemon_addr)
            .unwrap_or_else(|| DEFAULT_SERVO_DAEMON_ADDR.to_string());
        let track_interval = Duration::from_millis(
            file.tracker
                .and_then(|tracker| tracker.interval_ms)
                .unwrap_or(DEFAULT_TRACK_INTERVAL_MS),
        );
        let stream_interval = Duration::from_millis(
            file.stream
                .as_ref()
                .and_then(|stream| stream.interval_ms)
                .unwrap_or(DEFAULT_STREAM_INTERVAL_MS),
        );
        let jpeg_quality = file
            .stream
            .and_then(|stream| stream.jpeg_quality)
            .unwrap_or(DEFAULT_JPEG_QUALITY);
        Self {
            http_addr,
            auth,
            camera,
            servo_daemon_addr,
            track_interval,
            stream_interval,
            jpeg_quality,
        }
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("SKYTRACK_HTTP_ADDR") {
            if !addr.trim().is_empty() {
                self.http_addr = addr;
            }
        }
        if let Ok(username) = std::env::var("SKYTRACK_ADMIN_USERNAME") {
            if !username.trim().is_empty() {
                self.auth.username = username;
            }
        }
        if let Ok(password) = std::env::var("SKYTRACK_ADMIN_PASSWORD") {
            if !password.is_empty() {
                self.auth.password = password;
            }
        }
        if let Ok(device) = std::env::var("SKYTRACK_CAMERA_DEVICE") {
            if !device.trim().is_empty() {
                self.camera.device = device;
            }
        }
        if let Ok(addr) = std::env::var("SKYTRACK_PIGPIO_ADDR") {
            if !addr.trim().is_empty() {
                self.servo_daemon_addr = addr;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.auth.username.is_empty() || self.auth.password.is_empty() {
            return Err(anyhow!(
                "admin credentials must be configured (SKYTRACK_ADMIN_USERNAME / \
                 SKYTRACK_ADMIN_PASSWORD, or the auth section of the config file)"
            ));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera resolution must be non-zero"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("stream jpeg_quality must be in 1..=100"));
        }
        if self.track_interval.is_zero() || self.stream_interval.is_zero() {
            return Err(anyhow!("tracker and stream intervals must be non-zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<SkytrackdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
