//! Command-line configuration and validation.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::capture::DvTimings;
use crate::encode::EncoderKind;
use crate::video::{PixelFormat, Resolution};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "mjpeg-httpd", version)]
#[command(about = "Low-latency MJPEG-over-HTTP streaming server")]
pub struct Cli {
    // Capture
    /// Capture device path (or test:// for the synthetic source)
    #[arg(long, default_value = "/dev/video0")]
    pub device: String,

    /// Input index on the capture device
    #[arg(long)]
    pub input: Option<u32>,

    /// Desired pixel format (yuyv, uyvy, rgb24, bgr24, jpeg, mjpeg, h264, grey)
    #[arg(long, default_value = "yuyv")]
    pub format: String,

    /// Desired resolution, WxH
    #[arg(long, default_value = "640x480")]
    pub resolution: String,

    /// Desired frame rate (0 = device maximum)
    #[arg(long, default_value_t = 30)]
    pub desired_fps: u32,

    /// Digital-video timings: none, query, or WxH
    #[arg(long, default_value = "none")]
    pub dv_timings: String,

    /// Analog video standard hint
    #[arg(long)]
    pub standard: Option<String>,

    /// Keep retrying when the device disappears instead of exiting
    #[arg(long)]
    pub persistent: bool,

    /// Raw ring depth (at least 2)
    #[arg(long, default_value_t = 4)]
    pub buffers: u32,

    /// Encode worker count hint (default: CPU count, capped by buffers)
    #[arg(long)]
    pub workers: Option<u32>,

    // Encoding
    /// Encoder: cpu, m2m-image, m2m-video or hw
    #[arg(long, default_value = "cpu")]
    pub encoder: String,

    /// JPEG quality, 1-100
    #[arg(long, default_value_t = 80)]
    pub quality: u8,

    // Stream
    /// Suppress up to N consecutive identical frames (0 disables)
    #[arg(long, default_value_t = 0)]
    pub drop_same_frames: u32,

    /// Minimum interval between parts per client, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub stream_interval_ms: u64,

    /// How long the stream stays online after the last real frame
    #[arg(long, default_value_t = 1000)]
    pub online_window_ms: u64,

    /// Offline placeholder republish interval
    #[arg(long, default_value_t = 1000)]
    pub offline_refresh_ms: u64,

    // HTTP
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Listen on a Unix socket instead of TCP
    #[arg(long)]
    pub unix: Option<PathBuf>,

    /// HTTP basic auth user
    #[arg(long)]
    pub user: Option<String>,

    /// HTTP basic auth password
    #[arg(long)]
    pub passwd: Option<String>,

    /// Serve this directory instead of the built-in index page
    #[arg(long = "static")]
    pub static_dir: Option<PathBuf>,

    /// Access-Control-Allow-Origin value (empty disables CORS headers)
    #[arg(long, default_value = "")]
    pub allow_origin: String,

    /// Per-connection pending-byte limit before a slow client is dropped
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    pub stream_client_buffer: usize,

    /// Include the process command line in /state
    #[arg(long)]
    pub expose_cmdline: bool,

    /// Include the device path in /state
    #[arg(long)]
    pub expose_path: bool,

    /// Report this resolution in /state instead of the applied one
    #[arg(long)]
    pub fake_resolution: Option<String>,

    // Misc
    /// Log level: error, info, verbose or debug
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Info,
    Verbose,
    Debug,
}

impl LogLevel {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "info" => Some(Self::Info),
            "verbose" => Some(Self::Verbose),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }

    /// The tracing filter directive this level maps to.
    pub fn directive(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Info => "info",
            Self::Verbose => "debug",
            Self::Debug => "trace",
        }
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub device: String,
    pub input: Option<u32>,
    pub format: PixelFormat,
    pub resolution: Resolution,
    pub desired_fps: u32,
    pub dv_timings: DvTimings,
    pub standard: Option<String>,
    pub persistent: bool,
    pub buffers: u32,
    pub workers: u32,

    pub encoder: EncoderKind,
    pub quality: u8,

    pub drop_same_frames: u32,
    pub stream_interval: Duration,
    pub online_window: Duration,
    pub offline_refresh: Duration,

    pub host: String,
    pub port: u16,
    pub unix: Option<PathBuf>,
    pub user: Option<String>,
    pub passwd: Option<String>,
    pub static_dir: Option<PathBuf>,
    pub allow_origin: String,
    pub stream_client_buffer: usize,
    pub expose_cmdline: bool,
    pub expose_path: bool,
    pub fake_resolution: Option<Resolution>,

    pub log_level: LogLevel,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let format = PixelFormat::parse(&cli.format)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown format {:?}", cli.format)))?;

        let resolution: Resolution = cli.resolution.parse().map_err(ConfigError::Invalid)?;

        let encoder = EncoderKind::parse(&cli.encoder)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown encoder {:?}", cli.encoder)))?;

        let log_level = LogLevel::parse(&cli.log_level).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown log level {:?}", cli.log_level))
        })?;

        let dv_timings = match cli.dv_timings.to_ascii_lowercase().as_str() {
            "none" => DvTimings::None,
            "query" => DvTimings::Query,
            fixed => {
                let r: Resolution = fixed.parse().map_err(|_| {
                    ConfigError::Invalid(format!(
                        "dv-timings must be none, query or WxH, got {:?}",
                        cli.dv_timings
                    ))
                })?;
                DvTimings::Fixed {
                    width: r.width,
                    height: r.height,
                }
            }
        };

        let fake_resolution = match &cli.fake_resolution {
            Some(s) => Some(s.parse::<Resolution>().map_err(ConfigError::Invalid)?),
            None => None,
        };

        if !(1..=100).contains(&cli.quality) {
            return Err(ConfigError::Invalid(format!(
                "quality must be 1..=100, got {}",
                cli.quality
            )));
        }

        if cli.buffers < 2 {
            return Err(ConfigError::Invalid(format!(
                "buffers must be at least 2, got {}",
                cli.buffers
            )));
        }

        if cli.drop_same_frames > 30 {
            return Err(ConfigError::Invalid(format!(
                "drop-same-frames must be 0..=30, got {}",
                cli.drop_same_frames
            )));
        }

        if cli.passwd.is_some() && cli.user.is_none() {
            return Err(ConfigError::Invalid("passwd given without user".to_string()));
        }

        let workers = match cli.workers {
            Some(0) => {
                return Err(ConfigError::Invalid("workers must be at least 1".into()));
            }
            Some(n) => n,
            None => std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
        };

        Ok(Self {
            device: cli.device,
            input: cli.input,
            format,
            resolution,
            desired_fps: cli.desired_fps,
            dv_timings,
            standard: cli.standard,
            persistent: cli.persistent,
            buffers: cli.buffers,
            workers,
            encoder,
            quality: cli.quality,
            drop_same_frames: cli.drop_same_frames,
            stream_interval: Duration::from_millis(cli.stream_interval_ms),
            online_window: Duration::from_millis(cli.online_window_ms),
            offline_refresh: Duration::from_millis(cli.offline_refresh_ms),
            host: cli.host,
            port: cli.port,
            unix: cli.unix,
            user: cli.user,
            passwd: cli.passwd,
            static_dir: cli.static_dir,
            allow_origin: cli.allow_origin,
            stream_client_buffer: cli.stream_client_buffer,
            expose_cmdline: cli.expose_cmdline,
            expose_path: cli.expose_path,
            fake_resolution,
            log_level,
        })
    }
}

impl Default for Config {
    /// Test-friendly defaults: synthetic source, ephemeral port.
    fn default() -> Self {
        Self {
            device: "test://".into(),
            input: None,
            format: PixelFormat::Yuyv,
            resolution: Resolution::new(640, 480),
            desired_fps: 30,
            dv_timings: DvTimings::None,
            standard: None,
            persistent: false,
            buffers: 4,
            workers: 2,
            encoder: EncoderKind::Cpu,
            quality: 80,
            drop_same_frames: 0,
            stream_interval: Duration::ZERO,
            online_window: Duration::from_secs(1),
            offline_refresh: Duration::from_secs(1),
            host: "127.0.0.1".into(),
            port: 0,
            unix: None,
            user: None,
            passwd: None,
            static_dir: None,
            allow_origin: String::new(),
            stream_client_buffer: 4 * 1024 * 1024,
            expose_cmdline: false,
            expose_path: false,
            fake_resolution: None,
            log_level: LogLevel::Info,
        }
    }
}
