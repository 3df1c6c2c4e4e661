//! JPEG encoding and MJPEG multipart framing.
//!
//! One streamed chunk is a complete JPEG of the latest frame. Quality trades
//! fidelity for latency; 85 matches the deployed encoder setting. Encode
//! failures yield `None`; the caller skips the cycle and the stream stays up.

use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, RgbImage};

use crate::frame::Frame;

/// Default JPEG quality for the MJPEG stream, on the encoder's 1..=100 scale.
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Boundary marker separating MJPEG parts. Matches the boundary announced in
/// the stream response's Content-Type header.
pub const MJPEG_BOUNDARY: &str = "frame";

/// Encode a frame as JPEG. `None` means "no frame available this cycle":
/// unsupported channel layout, geometry/buffer mismatch, or encoder failure.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Option<Vec<u8>> {
    if !frame.is_complete() {
        return None;
    }
    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
    match frame.channels {
        3 => {
            let img: RgbImage =
                RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())?;
            encoder.encode_image(&img).ok()?;
        }
        1 => {
            let img: GrayImage =
                GrayImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())?;
            encoder.encode_image(&img).ok()?;
        }
        other => {
            log::debug!("stream: unsupported channel count {}", other);
            return None;
        }
    }
    Some(jpeg)
}

/// Frame one JPEG as an MJPEG part: boundary line, part headers, image bytes,
/// trailing CRLF. Content-Length lets clients validate chunk boundaries.
pub fn mjpeg_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {len}\r\n\r\n",
        boundary = MJPEG_BOUNDARY,
        len = jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_rgb_frame_as_jpeg() {
        let frame = Frame::new(vec![128u8; 8 * 8 * 3], 8, 8, 3);
        let jpeg = encode_jpeg(&frame, DEFAULT_JPEG_QUALITY).expect("encode");
        // JPEG SOI and EOI markers
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn encodes_greyscale_frame_as_jpeg() {
        let frame = Frame::new(vec![0u8, 64, 128, 255], 2, 2, 1);
        let jpeg = encode_jpeg(&frame, 80).expect("encode");
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn rejects_unsupported_channel_layout() {
        let frame = Frame::new(vec![0u8; 2 * 2 * 4], 2, 2, 4);
        assert!(encode_jpeg(&frame, 85).is_none());
    }

    #[test]
    fn rejects_incomplete_buffer() {
        let frame = Frame::new(vec![0u8; 5], 640, 480, 3);
        assert!(encode_jpeg(&frame, 85).is_none());
    }

    #[test]
    fn mjpeg_part_frames_jpeg_bytes() {
        let jpeg = vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9];
        let part = mjpeg_part(&jpeg);
        let text = String::from_utf8_lossy(&part);

        assert!(text.starts_with("--frame\r\n"));
        assert!(text.contains("Content-Type: image/jpeg\r\n"));
        assert!(text.contains("Content-Length: 6\r\n\r\n"));
        assert!(part.ends_with(b"\r\n"));
        // The payload sits between the blank line and the trailing CRLF.
        let body_start = part.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert_eq!(&part[body_start..body_start + jpeg.len()], &jpeg[..]);
    }
}
