//! V4L2-backed capture source (Linux).
//!
//! Thin driver: open the device, negotiate format and rate, pull frames
//! from a memory-mapped stream. `input`, `standard` and DV timings are
//! accepted in the request but not programmed by this driver.

use std::io;
use std::path::PathBuf;

use tracing::{info, warn};
use v4l::buffer::Type as BufferType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Format;
use v4l::FourCC;

use crate::error::SourceError;
use crate::video::{Frame, PixelFormat};

use super::source::{AppliedFormat, CaptureSource, Grab, SourceRequest};

pub struct V4l2Source {
    path: PathBuf,
    device: Option<Device>,
    stream: Option<MmapStream<'static>>,
    applied: Option<AppliedFormat>,
}

impl V4l2Source {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            device: None,
            stream: None,
            applied: None,
        }
    }
}

/// Errnos that mean the device itself is gone, not just one bad read.
fn is_device_lost(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(6)   // ENXIO
        | Some(19)  // ENODEV
        | Some(5)   // EIO
        | Some(32)  // EPIPE
        | Some(108) // ESHUTDOWN
    )
}

impl CaptureSource for V4l2Source {
    fn open(&mut self, request: &SourceRequest) -> Result<AppliedFormat, SourceError> {
        self.close();

        let device = Device::with_path(&self.path).map_err(|e| {
            SourceError::Transient(format!("open {:?}: {}", self.path, e))
        })?;

        if request.input.is_some() || request.standard.is_some() {
            warn!("input/standard selection not supported by this driver, ignoring");
        }

        let requested = Format::new(
            request.width,
            request.height,
            FourCC::new(&request.format.fourcc()),
        );
        let actual = device
            .set_format(&requested)
            .map_err(|e| SourceError::Transient(format!("set_format: {}", e)))?;

        let format = PixelFormat::from_fourcc(actual.fourcc.repr).ok_or_else(|| {
            SourceError::Unsupported(format!("device picked unknown fourcc {}", actual.fourcc))
        })?;

        if request.fps > 0 {
            if let Err(e) = device.set_params(&Parameters::with_fps(request.fps)) {
                warn!(fps = request.fps, "failed to set hardware FPS: {}", e);
            }
        }

        let stream =
            MmapStream::with_buffers(&device, BufferType::VideoCapture, request.buffers)
                .map_err(|e| SourceError::Transient(format!("mmap stream: {}", e)))?;

        let applied = AppliedFormat {
            width: actual.width,
            height: actual.height,
            format,
            stride: actual.stride,
            fps: request.fps,
        };
        info!(
            device = %self.path.display(),
            resolution = %format!("{}x{}", applied.width, applied.height),
            format = %applied.format,
            stride = applied.stride,
            "V4L2 capture negotiated"
        );

        self.device = Some(device);
        self.stream = Some(stream);
        self.applied = Some(applied);
        Ok(applied)
    }

    fn grab(&mut self, dest: &mut Frame) -> Result<Grab, SourceError> {
        let applied = self
            .applied
            .ok_or_else(|| SourceError::Transient("device not open".into()))?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SourceError::Transient("device not open".into()))?;

        let (buf, meta) = match stream.next() {
            Ok(frame_data) => frame_data,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(Grab::Timeout),
            Err(e) if is_device_lost(&e) => {
                return Err(SourceError::Gone(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
            Err(e) => return Err(SourceError::Transient(e.to_string())),
        };

        let used = meta.bytesused as usize;
        dest.write_from(&buf[..used.min(buf.len())]);
        dest.width = applied.width;
        dest.height = applied.height;
        dest.format = applied.format;
        dest.stride = applied.stride;
        Ok(Grab::Frame)
    }

    fn close(&mut self) {
        // Stream first so the mmap arena unmaps before the fd closes.
        self.stream = None;
        self.device = None;
        self.applied = None;
    }
}
