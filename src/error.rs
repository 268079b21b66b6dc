//! Error types shared across the pipeline.

use thiserror::Error;

use crate::video::PixelFormat;

/// Failures reported by a capture source.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Transient I/O problem; the capturer retries with backoff.
    #[error("source I/O error: {0}")]
    Transient(String),

    /// The device vanished. Fatal unless `--persistent` is set.
    #[error("source gone: {0}")]
    Gone(String),

    /// The requested configuration cannot be applied by this source.
    #[error("unsupported source configuration: {0}")]
    Unsupported(String),
}

/// Failures reported by an encoder for a single frame.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("cannot encode {0} input to JPEG")]
    UnsupportedFormat(PixelFormat),

    #[error("bad frame geometry: {0}")]
    Geometry(String),

    #[error("jpeg encoding failed: {0}")]
    Codec(String),
}

/// Exit codes surfaced to the supervisor.
pub mod exit {
    /// Clean shutdown.
    pub const OK: i32 = 0;
    /// Generic fatal error (encoder pool halted, source gone).
    pub const FATAL: i32 = 1;
    /// Invalid configuration.
    pub const BAD_CONFIG: i32 = 2;
    /// Listen socket acquisition failed.
    pub const BIND: i32 = 3;
}
