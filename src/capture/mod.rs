//! Camera lifecycle and frame acquisition.
//!
//! `CameraSource` owns the physical camera and produces `Frame` snapshots on
//! demand. Two backends:
//! - a V4L2 device (`/dev/video*`, feature `camera-v4l2`)
//! - a synthetic source (`stub://` device paths) used by tests and
//!   hardware-free development
//!
//! All methods take `&self`; an internal mutex serializes device access so
//! several streaming clients can call `capture()` concurrently without
//! tripping over exclusive hardware. Only the capture itself is serialized:
//! the frame cache has its own lock, so readers of the previous frame are
//! never blocked by an in-flight capture.
//!
//! Failure split: `start()` fails with a fatal `HardwareError` (the daemon
//! must not come up half-initialized), `capture()` fails with a
//! `TransientCaptureError` (the caller skips one cycle and retries).

use anyhow::Result;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::{HardwareError, TransientCaptureError};

#[cfg(feature = "camera-v4l2")]
mod v4l2;

/// Configuration for the camera session. Resolution and channel layout are
/// fixed for the lifetime of the session.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Device path (e.g. "/dev/video0") or "stub://name" for the synthetic
    /// backend.
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Target frame rate requested from the device.
    pub target_fps: u32,
    /// Warm-up wait after the device starts delivering, before `start`
    /// returns. Real sensors need auto-exposure to settle.
    pub warmup_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "stub://camera".to_string(),
            width: 640,
            height: 480,
            target_fps: 30,
            warmup_ms: 2_000,
        }
    }
}

/// Capture statistics, logged periodically by the daemon.
#[derive(Clone, Debug)]
pub struct CameraStats {
    pub frames_captured: u64,
    pub device: String,
}

pub struct CameraSource {
    inner: Mutex<Inner>,
}

struct Inner {
    config: CameraConfig,
    backend: Backend,
    running: bool,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

enum Backend {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "camera-v4l2")]
    Device(v4l2::DeviceCamera),
}

impl CameraSource {
    pub fn new(config: CameraConfig) -> Result<Self> {
        let backend = if config.device.starts_with("stub://") {
            Backend::Synthetic(SyntheticCamera::new(&config))
        } else {
            device_backend(&config)?
        };
        Ok(Self {
            inner: Mutex::new(Inner {
                config,
                backend,
                running: false,
                frame_count: 0,
                last_frame_at: None,
                last_error: None,
            }),
        })
    }

    /// Configure the hardware, begin capture, and wait out the warm-up
    /// period. Idempotent when already running. Any open/configure failure is
    /// a fatal `HardwareError`.
    pub fn start(&self) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.running {
            return Ok(());
        }
        let warmup = match &mut inner.backend {
            Backend::Synthetic(camera) => {
                camera.open();
                Duration::ZERO
            }
            #[cfg(feature = "camera-v4l2")]
            Backend::Device(camera) => {
                camera.open()?;
                Duration::from_millis(inner.config.warmup_ms)
            }
        };
        if !warmup.is_zero() {
            std::thread::sleep(warmup);
        }
        inner.running = true;
        inner.last_error = None;
        log::info!("camera started on {}", inner.config.device);
        Ok(())
    }

    /// Release the hardware. Calling it when not running is a no-op.
    pub fn stop(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.running {
            return;
        }
        match &mut inner.backend {
            Backend::Synthetic(_) => {}
            #[cfg(feature = "camera-v4l2")]
            Backend::Device(camera) => camera.close(),
        }
        inner.running = false;
        log::info!("camera stopped");
    }

    /// Capture one frame snapshot. The device buffer is copied out before the
    /// lock is released; the returned `Frame` is owned by the caller.
    pub fn capture(&self) -> std::result::Result<Frame, TransientCaptureError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.running {
            return Err(TransientCaptureError::new("camera not running"));
        }
        let grabbed: std::result::Result<Frame, TransientCaptureError> =
            match &mut inner.backend {
                Backend::Synthetic(camera) => Ok(camera.grab(inner.frame_count)),
                #[cfg(feature = "camera-v4l2")]
                Backend::Device(camera) => camera.grab(),
            };
        match grabbed {
            Ok(frame) => {
                inner.frame_count += 1;
                inner.last_frame_at = Some(Instant::now());
                inner.last_error = None;
                Ok(frame)
            }
            Err(err) => {
                inner.last_error = Some(err.message.clone());
                Err(err)
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        let inner = self.lock();
        if !inner.running || inner.last_error.is_some() {
            return false;
        }
        let Some(last_frame_at) = inner.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= health_grace(inner.config.target_fps)
    }

    pub fn stats(&self) -> CameraStats {
        let inner = self.lock();
        CameraStats {
            frames_captured: inner.frame_count,
            device: inner.config.device.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("camera lock poisoned")
    }
}

fn device_backend(config: &CameraConfig) -> Result<Backend> {
    #[cfg(feature = "camera-v4l2")]
    {
        return Ok(Backend::Device(v4l2::DeviceCamera::new(config)));
    }
    #[cfg(not(feature = "camera-v4l2"))]
    {
        Err(HardwareError::new(format!(
            "camera device '{}' requires the camera-v4l2 feature",
            config.device
        ))
        .into())
    }
}

fn health_grace(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests and hardware-free runs
// ----------------------------------------------------------------------------

struct SyntheticCamera {
    width: u32,
    height: u32,
}

impl SyntheticCamera {
    fn new(config: &CameraConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
        }
    }

    fn open(&mut self) {
        log::info!("camera: synthetic source ({}x{})", self.width, self.height);
    }

    /// Deterministic test pattern: a dim gradient background with one bright
    /// white pixel that drifts a little every frame, so the tracker has
    /// something to follow.
    fn grab(&mut self, frame_count: u64) -> Frame {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![0u8; w * h * 3];
        for y in 0..h {
            for x in 0..w {
                let shade = ((x + y) % 48) as u8;
                let idx = (y * w + x) * 3;
                data[idx] = shade;
                data[idx + 1] = shade;
                data[idx + 2] = shade;
            }
        }
        if w > 0 && h > 0 {
            let spot_x = (frame_count as usize * 7) % w;
            let spot_y = (frame_count as usize * 3) % h;
            let idx = (spot_y * w + spot_x) * 3;
            data[idx] = 255;
            data[idx + 1] = 255;
            data[idx + 2] = 255;
        }
        Frame::new(data, self.width, self.height, 3)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::brightest_pixel;

    fn stub_config() -> CameraConfig {
        CameraConfig {
            device: "stub://test".to_string(),
            width: 64,
            height: 48,
            target_fps: 30,
            warmup_ms: 0,
        }
    }

    #[test]
    fn synthetic_source_produces_frames() -> Result<()> {
        let camera = CameraSource::new(stub_config())?;
        camera.start()?;

        let frame = camera.capture().expect("synthetic capture");
        assert_eq!(frame.width, 64);
        assert_eq!(frame.height, 48);
        assert_eq!(frame.channels, 3);
        assert!(frame.is_complete());

        Ok(())
    }

    #[test]
    fn capture_before_start_is_transient() -> Result<()> {
        let camera = CameraSource::new(stub_config())?;
        let err = camera.capture().expect_err("not running");
        assert!(err.message.contains("not running"));
        Ok(())
    }

    #[test]
    fn stop_is_idempotent() -> Result<()> {
        let camera = CameraSource::new(stub_config())?;
        camera.stop();
        camera.start()?;
        camera.stop();
        camera.stop();
        assert!(camera.capture().is_err());
        Ok(())
    }

    #[test]
    fn start_is_idempotent_and_counts_frames() -> Result<()> {
        let camera = CameraSource::new(stub_config())?;
        camera.start()?;
        camera.start()?;

        camera.capture().expect("first");
        camera.capture().expect("second");
        let stats = camera.stats();
        assert_eq!(stats.frames_captured, 2);
        assert_eq!(stats.device, "stub://test");
        Ok(())
    }

    #[test]
    fn synthetic_bright_spot_drifts() -> Result<()> {
        let camera = CameraSource::new(stub_config())?;
        camera.start()?;

        let first = brightest_pixel(&camera.capture().expect("frame"));
        let second = brightest_pixel(&camera.capture().expect("frame"));
        assert_ne!(first, second, "bright spot should move between frames");
        Ok(())
    }
}
