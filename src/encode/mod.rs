//! JPEG encoders and the worker pool.

pub mod cpu;
pub mod pool;

pub use cpu::CpuEncoder;
pub use pool::{CoordMsg, WorkerPool};

use std::fmt;

use tracing::warn;

use crate::error::EncodeError;
use crate::video::Frame;

/// Consecutive encode failures before a worker downgrades its encoder
/// to CPU, and before a CPU-only worker halts the pool.
pub const FATAL_ENCODER_LIMIT: u32 = 5;

/// One encoding capability. Each worker owns its instance exclusively;
/// instances are never shared across threads.
pub trait Encoder: Send {
    fn name(&self) -> &'static str;

    /// Compresses `raw` into `out` as a JPEG payload.
    fn encode(&mut self, raw: &Frame, out: &mut Vec<u8>) -> Result<(), EncodeError>;
}

/// Encoder selection, a closed set fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Cpu,
    M2mImage,
    M2mVideo,
    Hw,
}

impl EncoderKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "cpu" => Some(Self::Cpu),
            "m2m-image" => Some(Self::M2mImage),
            "m2m-video" => Some(Self::M2mVideo),
            "hw" => Some(Self::Hw),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::M2mImage => "M2M-IMAGE",
            Self::M2mVideo => "M2M-VIDEO",
            Self::Hw => "HW",
        }
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Platform M2M/GPU encoders are external drivers selected at build
/// time; none are linked into this build.
fn open_hardware(_kind: EncoderKind, _quality: u8) -> Option<Box<dyn Encoder>> {
    None
}

/// An encoder with a guaranteed CPU path underneath.
///
/// A hardware encoder that rejects one frame's geometry falls back to
/// CPU for that frame only; repeated failures downgrade the worker to
/// CPU for good.
pub struct FallbackEncoder {
    primary: Option<Box<dyn Encoder>>,
    cpu: CpuEncoder,
}

impl FallbackEncoder {
    pub fn new(kind: EncoderKind, quality: u8) -> Self {
        let primary = match kind {
            EncoderKind::Cpu => None,
            other => {
                let hw = open_hardware(other, quality);
                if hw.is_none() {
                    warn!(encoder = %other, "no hardware driver in this build, using CPU");
                }
                hw
            }
        };
        Self {
            primary,
            cpu: CpuEncoder::new(quality),
        }
    }

    /// Drops the hardware path permanently. Returns false when the
    /// worker was already CPU-only, which means there is nothing left
    /// to fall back to.
    pub fn downgrade_to_cpu(&mut self) -> bool {
        if self.primary.is_some() {
            warn!("downgrading worker to CPU encoder");
            self.primary = None;
            true
        } else {
            false
        }
    }
}

impl Encoder for FallbackEncoder {
    fn name(&self) -> &'static str {
        match &self.primary {
            Some(hw) => hw.name(),
            None => self.cpu.name(),
        }
    }

    fn encode(&mut self, raw: &Frame, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        if let Some(hw) = self.primary.as_mut() {
            return match hw.encode(raw, out) {
                Ok(()) => Ok(()),
                // Geometry the hardware cannot take goes through CPU
                // transparently for this frame.
                Err(EncodeError::Geometry(_)) => self.cpu.encode(raw, out),
                Err(e) => Err(e),
            };
        }
        self.cpu.encode(raw, out)
    }
}
