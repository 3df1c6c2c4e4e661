//! Bright-spot analysis and the background tracker loop.
//!
//! `brightest_pixel` is a pure function from a frame to the coordinate of its
//! maximum-luminance pixel. The `Tracker` runs it against the frame cache on a
//! fixed cadence and publishes the result into a `SharedCoordinate` that HTTP
//! readers copy out. The loop keeps running with zero streaming clients; when
//! no frame (or a bad frame) is available it leaves the previous coordinate in
//! place: stale-but-valid beats flapping back to a default.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::{Frame, FrameCache};

/// Tracker cadence. Policy constant, not a correctness requirement.
pub const DEFAULT_TRACK_INTERVAL: Duration = Duration::from_millis(50);

/// Pixel location, x = column, y = row. (0,0) until the first computation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: u32,
    pub y: u32,
}

/// Locate the brightest pixel in a frame.
///
/// Per-pixel brightness is the mean of the channel intensities; with a fixed
/// channel count the channel *sum* orders identically, so the scan compares
/// sums and never divides. Single linear pass, row-major, strictly-greater
/// comparison: ties resolve to the lowest y, then the lowest x.
///
/// An empty or channel-less frame yields (0,0); callers always get a value.
pub fn brightest_pixel(frame: &Frame) -> Coordinate {
    let channels = frame.channels as usize;
    if channels == 0 || frame.width == 0 {
        return Coordinate::default();
    }
    let width = frame.width as usize;

    let mut best = Coordinate::default();
    let mut best_sum = 0u32;
    for (idx, pixel) in frame.pixels().chunks_exact(channels).enumerate() {
        let sum: u32 = pixel.iter().map(|&c| c as u32).sum();
        if sum > best_sum {
            best_sum = sum;
            best = Coordinate {
                x: (idx % width) as u32,
                y: (idx / width) as u32,
            };
        }
    }
    best
}

/// Externally visible coordinate: one writer (the tracker loop), many readers
/// (HTTP handlers). The lock is held for the copy only.
pub struct SharedCoordinate {
    inner: Mutex<Coordinate>,
}

impl SharedCoordinate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Coordinate::default()),
        }
    }

    pub fn store(&self, coordinate: Coordinate) {
        let mut guard = self.inner.lock().expect("coordinate lock poisoned");
        *guard = coordinate;
    }

    pub fn current(&self) -> Coordinate {
        *self.inner.lock().expect("coordinate lock poisoned")
    }
}

impl Default for SharedCoordinate {
    fn default() -> Self {
        Self::new()
    }
}

/// Background coordinate publisher.
///
/// Idle until `spawn()`; then it loops until the handle's shutdown flag flips.
/// Each cycle is one `tick()`: snapshot, locate, store.
pub struct Tracker {
    cache: Arc<FrameCache>,
    coordinate: Arc<SharedCoordinate>,
    interval: Duration,
}

impl Tracker {
    pub fn new(cache: Arc<FrameCache>, coordinate: Arc<SharedCoordinate>) -> Self {
        Self {
            cache,
            coordinate,
            interval: DEFAULT_TRACK_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run exactly one tracker cycle. Tests drive this directly instead of
    /// sleeping on the wall clock. Returns true when a frame was analyzed.
    pub fn tick(cache: &FrameCache, coordinate: &SharedCoordinate) -> bool {
        let Some(frame) = cache.snapshot() else {
            return false;
        };
        if !frame.is_complete() {
            log::debug!("tracker: skipping incomplete frame");
            return false;
        }
        coordinate.store(brightest_pixel(&frame));
        true
    }

    pub fn spawn(self) -> TrackerHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::spawn(move || {
            log::info!(
                "tracker running at {}ms cadence",
                self.interval.as_millis()
            );
            while !shutdown_thread.load(Ordering::SeqCst) {
                Self::tick(&self.cache, &self.coordinate);
                std::thread::sleep(self.interval);
            }
        });
        TrackerHandle {
            shutdown,
            join: Some(join),
        }
    }
}

pub struct TrackerHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl TrackerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| anyhow!("tracker thread panicked"))?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
