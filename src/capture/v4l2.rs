//! V4L2 device backend for `CameraSource`.
//!
//! Opens a local device node, negotiates 24-bit RGB at the configured
//! resolution, and memory-maps a small ring of capture buffers. The device may
//! refuse the requested format or rate; whatever it actually delivers is read
//! back and used, so `grab` always labels frames with the active geometry.

use ouroboros::self_referencing;

use crate::frame::Frame;
use crate::{HardwareError, TransientCaptureError};

use super::CameraConfig;

const CAPTURE_BUFFERS: u32 = 4;

pub(super) struct DeviceCamera {
    device_path: String,
    requested_width: u32,
    requested_height: u32,
    target_fps: u32,
    active_width: u32,
    active_height: u32,
    state: Option<DeviceState>,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl DeviceCamera {
    pub(super) fn new(config: &CameraConfig) -> Self {
        Self {
            device_path: config.device.clone(),
            requested_width: config.width,
            requested_height: config.height,
            target_fps: config.target_fps,
            active_width: config.width,
            active_height: config.height,
            state: None,
        }
    }

    pub(super) fn open(&mut self) -> anyhow::Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device = v4l::Device::with_path(&self.device_path).map_err(|err| {
            HardwareError::new(format!("open v4l2 device {}: {}", self.device_path, err))
        })?;

        let mut format = device
            .format()
            .map_err(|err| HardwareError::new(format!("read v4l2 format: {}", err)))?;
        format.width = self.requested_width;
        format.height = self.requested_height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "camera: failed to set format on {}: {}",
                    self.device_path,
                    err
                );
                device.format().map_err(|err| {
                    HardwareError::new(format!("read v4l2 format after set failure: {}", err))
                })?
            }
        };

        if self.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("camera: failed to set fps on {}: {}", self.device_path, err);
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;

        let state = DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, CAPTURE_BUFFERS)
                    .map_err(|err| {
                        HardwareError::new(format!("create v4l2 buffer stream: {}", err))
                    })
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "camera: opened {} ({}x{})",
            self.device_path,
            self.active_width,
            self.active_height
        );
        Ok(())
    }

    pub(super) fn close(&mut self) {
        self.state = None;
    }

    pub(super) fn grab(&mut self) -> Result<Frame, TransientCaptureError> {
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| TransientCaptureError::new("v4l2 device not open"))?;
        let buf = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|err| TransientCaptureError::new(format!("v4l2 frame read: {}", err)))?;

        let expected = (self.active_width as usize) * (self.active_height as usize) * 3;
        if buf.len() < expected {
            return Err(TransientCaptureError::new(format!(
                "short v4l2 buffer: {} bytes, expected {}",
                buf.len(),
                expected
            )));
        }
        Ok(Frame::new(buf, self.active_width, self.active_height, 3))
    }
}
