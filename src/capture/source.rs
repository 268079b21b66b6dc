//! Abstract capture source.
//!
//! The pipeline only sees this trait: a source negotiates a format and
//! then yields raw frames into caller-owned buffers. Concrete drivers
//! (V4L2 on Linux, the synthetic test pattern everywhere) live in
//! sibling modules and are picked by device-path scheme.

use crate::error::SourceError;
use crate::video::{Frame, PixelFormat};

/// Digital-video timing negotiation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DvTimings {
    None,
    /// Query the source for its current timings.
    Query,
    /// Force fixed timings.
    Fixed { width: u32, height: u32 },
}

/// What the capturer asks a source for.
#[derive(Debug, Clone)]
pub struct SourceRequest {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps: u32,
    pub input: Option<u32>,
    pub standard: Option<String>,
    pub dv_timings: DvTimings,
    pub buffers: u32,
}

/// What the source actually applied. Unknown geometries fall back to
/// the source's nearest supported format; this reports the result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppliedFormat {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: u32,
    pub fps: u32,
}

/// Outcome of one grab attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grab {
    /// A frame was written into the destination buffer.
    Frame,
    /// Nothing arrived within the source's internal timeout.
    Timeout,
    /// The source geometry changed; the capturer must renegotiate.
    SourceChanged,
}

/// A raw-frame producer the capturer drives.
pub trait CaptureSource: Send {
    /// Negotiates the requested configuration and returns what was
    /// actually applied.
    fn open(&mut self, request: &SourceRequest) -> Result<AppliedFormat, SourceError>;

    /// Blocks for the next frame and writes it into `dest`, setting the
    /// frame's geometry, format, stride and `used`.
    fn grab(&mut self, dest: &mut Frame) -> Result<Grab, SourceError>;

    /// Releases the device. Idempotent.
    fn close(&mut self);
}

/// Opens the driver matching a device path.
///
/// `test://` selects the synthetic pattern source; anything else is
/// handed to the platform driver.
pub fn open_source(device: &str) -> Result<Box<dyn CaptureSource>, SourceError> {
    if device.starts_with("test://") || device == "test" {
        return Ok(Box::new(super::pattern::TestPatternSource::from_device(
            device,
        )?));
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(super::v4l2::V4l2Source::new(device)))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(SourceError::Unsupported(format!(
            "no capture driver for {:?} on this platform",
            device
        )))
    }
}
