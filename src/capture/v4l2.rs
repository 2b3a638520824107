//! V4L2 camera source.
//!
//! Requests RGB24 at the configured size and rate; if the driver negotiates a
//! different format the buffer is converted (YUYV and NV12 are supported).

use anyhow::Context;
use image::RgbImage;
use ouroboros::self_referencing;

use super::normalize::{to_rgb_image, PixelFormat};
use super::{CameraConfig, CameraDevice};
use crate::error::{PipelineError, PipelineResult};

const BUFFER_COUNT: u32 = 4;

pub struct V4l2Camera {
    config: CameraConfig,
    state: Option<V4l2State>,
    format: PixelFormat,
    active_width: u32,
    active_height: u32,
    frame_count: u64,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Camera {
    pub fn open(config: CameraConfig) -> PipelineResult<Self> {
        Self::connect(config).map_err(|err| PipelineError::Device(format!("{:#}", err)))
    }

    fn connect(config: CameraConfig) -> anyhow::Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&config.device)
            .with_context(|| format!("open v4l2 device {}", config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("camera: failed to set format on {}: {}", config.device, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).with_context(|| {
            format!(
                "{} negotiated unsupported pixel format {}",
                config.device, format.fourcc
            )
        })?;

        if config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("camera: failed to set fps on {}: {}", config.device, err);
            }
        }

        let state = V4l2StateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "camera: opened {} ({}x{} {:?})",
            config.device,
            format.width,
            format.height,
            pixel_format
        );
        Ok(Self {
            config,
            state: Some(state),
            format: pixel_format,
            active_width: format.width,
            active_height: format.height,
            frame_count: 0,
        })
    }
}

impl CameraDevice for V4l2Camera {
    fn read_frame(&mut self) -> PipelineResult<Option<RgbImage>> {
        use v4l::io::traits::CaptureStream;

        let Some(state) = self.state.as_mut() else {
            return Ok(None);
        };
        let (width, height, format) = (self.active_width, self.active_height, self.format);
        let frame = state.with_mut(|fields| -> anyhow::Result<RgbImage> {
            let (buf, meta) = fields.stream.next().context("capture v4l2 frame")?;
            let used = match meta.bytesused as usize {
                0 => buf.len(),
                n => n.min(buf.len()),
            };
            to_rgb_image(&buf[..used], width, height, format)
        });
        match frame {
            Ok(frame) => {
                self.frame_count += 1;
                Ok(Some(frame))
            }
            Err(err) => Err(PipelineError::Device(format!(
                "{}: {:#}",
                self.config.device, err
            ))),
        }
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            log::info!(
                "camera: released {} after {} frames",
                self.config.device,
                self.frame_count
            );
        }
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.release();
    }
}
