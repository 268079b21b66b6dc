//! Synthetic moving-gradient source.
//!
//! Produces deterministic YUYV frames at the requested geometry and
//! rate, which makes it the workhorse of the test suite and a handy
//! demo source (`--device test://`). Behaviors are scripted through
//! URL-style options:
//!
//! - `static=1` — every frame is byte-identical (dedup testing)
//! - `fail_after=N` — the first open dies after N frames (loss/recovery)
//! - `silent=1` — opens fine but never yields a frame

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::SourceError;
use crate::video::{Frame, PixelFormat};

use super::source::{AppliedFormat, CaptureSource, Grab, SourceRequest};

#[derive(Debug, Clone)]
struct PatternOptions {
    static_frames: bool,
    fail_after: Option<u64>,
    silent: bool,
}

pub struct TestPatternSource {
    opts: PatternOptions,
    applied: Option<AppliedFormat>,
    frames_since_open: u64,
    open_count: u32,
    next_frame_due: Option<Instant>,
}

impl TestPatternSource {
    pub fn from_device(device: &str) -> Result<Self, SourceError> {
        let opts = parse_options(device)?;
        Ok(Self {
            opts,
            applied: None,
            frames_since_open: 0,
            open_count: 0,
            next_frame_due: None,
        })
    }
}

fn parse_options(device: &str) -> Result<PatternOptions, SourceError> {
    let query = device
        .strip_prefix("test://")
        .unwrap_or("")
        .trim_start_matches('?');

    let mut map = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, "1"));
        map.insert(key.to_string(), value.to_string());
    }

    let fail_after = match map.get("fail_after") {
        Some(v) => Some(v.parse::<u64>().map_err(|_| {
            SourceError::Unsupported(format!("bad fail_after value {:?}", v))
        })?),
        None => None,
    };

    Ok(PatternOptions {
        static_frames: map.get("static").map(|v| v == "1").unwrap_or(false),
        fail_after,
        silent: map.get("silent").map(|v| v == "1").unwrap_or(false),
    })
}

impl CaptureSource for TestPatternSource {
    fn open(&mut self, request: &SourceRequest) -> Result<AppliedFormat, SourceError> {
        // The pattern renders YUYV regardless of the requested raw
        // format; compressed requests fall back the same way a real
        // device coerces unsupported formats.
        let applied = AppliedFormat {
            width: request.width,
            height: request.height,
            format: PixelFormat::Yuyv,
            stride: request.width * 2,
            fps: if request.fps == 0 { 30 } else { request.fps },
        };
        self.applied = Some(applied);
        self.frames_since_open = 0;
        self.open_count += 1;
        self.next_frame_due = Some(Instant::now());
        Ok(applied)
    }

    fn grab(&mut self, dest: &mut Frame) -> Result<Grab, SourceError> {
        let applied = self
            .applied
            .ok_or_else(|| SourceError::Transient("pattern source not open".into()))?;

        if self.opts.silent {
            thread::sleep(Duration::from_millis(50));
            return Ok(Grab::Timeout);
        }

        // Scripted device loss, first open only.
        if self.open_count == 1 {
            if let Some(limit) = self.opts.fail_after {
                if self.frames_since_open >= limit {
                    return Err(SourceError::Gone("scripted device loss".into()));
                }
            }
        }

        // Pace to the configured rate.
        let interval = Duration::from_secs(1) / applied.fps;
        if let Some(due) = self.next_frame_due {
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
            self.next_frame_due = Some(due + interval);
        }

        let phase = if self.opts.static_frames {
            0
        } else {
            self.frames_since_open
        };
        render_yuyv(dest, applied.width, applied.height, phase);
        dest.format = PixelFormat::Yuyv;
        dest.width = applied.width;
        dest.height = applied.height;
        dest.stride = applied.stride;

        self.frames_since_open += 1;
        Ok(Grab::Frame)
    }

    fn close(&mut self) {
        self.applied = None;
        self.next_frame_due = None;
    }
}

/// Fills `dest` with a horizontally scrolling luma gradient.
fn render_yuyv(dest: &mut Frame, width: u32, height: u32, phase: u64) {
    let row_bytes = (width * 2) as usize;
    let total = row_bytes * height as usize;
    dest.ensure_capacity(total);

    let buf = dest.buffer_mut();
    for y in 0..height as usize {
        let row = &mut buf[y * row_bytes..(y + 1) * row_bytes];
        for pair in 0..(width as usize / 2) {
            let x = pair * 2;
            let luma0 = ((x as u64 + phase * 4) & 0xFF) as u8;
            let luma1 = ((x as u64 + 1 + phase * 4) & 0xFF) as u8;
            let chroma = ((y / 2) & 0xFF) as u8;
            row[pair * 4] = luma0;
            row[pair * 4 + 1] = 128u8.wrapping_add(chroma / 4);
            row[pair * 4 + 2] = luma1;
            row[pair * 4 + 3] = 128u8.wrapping_sub(chroma / 4);
        }
    }
    dest.set_used(total);
}
