//! Frame container and single-writer/multi-reader frame cache.
//!
//! - `Frame`: one captured image as a contiguous row-major pixel grid.
//! - `FrameCache`: holds the most recent frame under a mutex; readers get an
//!   independent copy, the writer swaps the whole buffer.
//!
//! The cache lock is held only for the clone or swap. Capture and encoding
//! always happen outside it, so a slow consumer never stalls the capture path.

use std::sync::Mutex;

/// One captured image: `width * height` pixels, `channels` 8-bit intensities
/// per pixel (3 = RGB, 1 = greyscale), row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap a pixel buffer. The buffer is truncated to `width * height *
    /// channels` if the capture layer handed over trailing stride padding.
    pub fn new(mut data: Vec<u8>, width: u32, height: u32, channels: u32) -> Self {
        let expected = (width as usize) * (height as usize) * (channels as usize);
        data.truncate(expected);
        Self {
            width,
            height,
            channels,
            data,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// True when the buffer holds every pixel the dimensions promise.
    pub fn is_complete(&self) -> bool {
        let expected = (self.width as usize) * (self.height as usize) * (self.channels as usize);
        self.data.len() == expected && expected > 0
    }
}

/// Most recent captured frame, shared by all readers.
///
/// Single writer (whichever streaming loop captured last), many readers (the
/// tracker loop and any other snapshot caller). Readers never observe a
/// partially-written frame: `publish` swaps the whole buffer under the lock
/// and `snapshot` clones it out under the same lock.
pub struct FrameCache {
    latest: Mutex<Option<Frame>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(None),
        }
    }

    /// Replace the cached frame. Atomic with respect to readers.
    pub fn publish(&self, frame: Frame) {
        let mut guard = self.latest.lock().expect("frame cache lock poisoned");
        *guard = Some(frame);
    }

    /// Independent copy of the current frame, or `None` before the first
    /// publish. The returned frame is detached: mutating it or holding it
    /// never blocks a future `publish`.
    pub fn snapshot(&self) -> Option<Frame> {
        let guard = self.latest.lock().expect("frame cache lock poisoned");
        guard.clone()
    }
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn solid_frame(value: u8) -> Frame {
        Frame::new(vec![value; 4 * 4 * 3], 4, 4, 3)
    }

    #[test]
    fn snapshot_before_publish_is_empty() {
        let cache = FrameCache::new();
        assert!(cache.snapshot().is_none());
    }

    #[test]
    fn snapshot_returns_published_frame() {
        let cache = FrameCache::new();
        let frame = solid_frame(7);
        cache.publish(frame.clone());

        let snap = cache.snapshot().expect("frame published");
        assert_eq!(snap, frame);
    }

    #[test]
    fn snapshot_is_detached_from_cache() {
        let cache = FrameCache::new();
        cache.publish(solid_frame(1));

        let snap = cache.snapshot().expect("frame published");
        cache.publish(solid_frame(2));

        // The earlier snapshot must not see the later publish.
        assert!(snap.pixels().iter().all(|&p| p == 1));
    }

    #[test]
    fn publish_truncates_stride_padding() {
        let mut data = vec![9u8; 2 * 2 * 3];
        data.extend_from_slice(&[0xAA; 16]);
        let frame = Frame::new(data, 2, 2, 3);
        assert_eq!(frame.pixels().len(), 12);
        assert!(frame.is_complete());
    }

    #[test]
    fn concurrent_publish_and_snapshot_never_tear() {
        let cache = Arc::new(FrameCache::new());
        cache.publish(solid_frame(0));

        let writer = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for round in 0u32..2_000 {
                    cache.publish(solid_frame((round % 251) as u8));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let snap = cache.snapshot().expect("frame always present");
                        let first = snap.pixels()[0];
                        // Every snapshot must equal some fully-published frame:
                        // all bytes identical, never a mix of two writes.
                        assert!(
                            snap.pixels().iter().all(|&p| p == first),
                            "torn read: mixed pixel values in one snapshot"
                        );
                    }
                })
            })
            .collect();

        writer.join().expect("writer thread");
        for reader in readers {
            reader.join().expect("reader thread");
        }
    }
}
