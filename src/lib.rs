//! Low-latency MJPEG-over-HTTP streaming.
//!
//! The pipeline captures raw frames from a [`capture::CaptureSource`],
//! fans them through a pool of JPEG encode workers over a slot ring,
//! reconciles the results into a monotonic published sequence and
//! serves the stream to any number of HTTP clients:
//!
//! - `GET /stream` — `multipart/x-mixed-replace` live stream
//! - `GET /snapshot` — the current frame as a single JPEG
//! - `GET /state` — JSON state and per-client statistics
//!
//! # Example
//!
//! ```no_run
//! use mjpeg_httpd::{config::Config, http, pipeline::Pipeline};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::default();
//! let pipeline = Pipeline::start(&config);
//! let state = http::AppState::new(&config, &pipeline);
//! let bound = http::bind(&config).await?;
//! http::serve(bound, http::router(state), async { /* shutdown */ }).await?;
//! pipeline.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! Sidecar consumers (shared-memory sinks, gateways) subscribe through
//! [`stream::Broadcaster`] and receive the same latest-wins
//! notifications as HTTP sessions.

pub mod capture;
pub mod clock;
pub mod config;
pub mod encode;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod ring;
pub mod stream;
pub mod video;

// Re-exports for convenience
pub use capture::{CaptureSource, Capturer};
pub use config::Config;
pub use encode::{Encoder, EncoderKind};
pub use pipeline::Pipeline;
pub use ring::RawRing;
pub use stream::Broadcaster;
pub use video::{EncodedFrame, Frame, PixelFormat, Resolution};
