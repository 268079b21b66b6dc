//! Pipeline counters and `/state` report types.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Rolling one-second frame-rate window.
#[derive(Debug)]
pub struct FpsCalculator {
    times: VecDeque<Instant>,
    window: Duration,
}

impl FpsCalculator {
    pub fn new() -> Self {
        Self {
            times: VecDeque::with_capacity(240),
            window: Duration::from_secs(1),
        }
    }

    pub fn record(&mut self) {
        let now = Instant::now();
        self.times.push_back(now);
        let cutoff = now - self.window;
        while let Some(&oldest) = self.times.front() {
            if oldest < cutoff {
                self.times.pop_front();
            } else {
                break;
            }
        }
    }

    /// Frames recorded in the last window.
    pub fn current_fps(&self) -> u32 {
        let cutoff = Instant::now() - self.window;
        self.times.iter().filter(|t| **t >= cutoff).count() as u32
    }
}

impl Default for FpsCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared counters for the whole pipeline. Atomics for the hot paths,
/// a short mutex for the FPS windows.
pub struct PipelineStats {
    captured: AtomicU64,
    published: AtomicU64,
    broken_frames: AtomicU64,
    encode_errors: AtomicU64,
    dropped_same: AtomicU64,
    dropped_late: AtomicU64,
    captured_fps: Mutex<FpsCalculator>,
    queued_fps: Mutex<FpsCalculator>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            captured: AtomicU64::new(0),
            published: AtomicU64::new(0),
            broken_frames: AtomicU64::new(0),
            encode_errors: AtomicU64::new(0),
            dropped_same: AtomicU64::new(0),
            dropped_late: AtomicU64::new(0),
            captured_fps: Mutex::new(FpsCalculator::new()),
            queued_fps: Mutex::new(FpsCalculator::new()),
        }
    }

    pub fn record_captured(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
        self.captured_fps.lock().record();
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.queued_fps.lock().record();
    }

    pub fn record_broken_frame(&self) {
        self.broken_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encode_error(&self) {
        self.encode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_same(&self) {
        self.dropped_same.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_late(&self) {
        self.dropped_late.fetch_add(1, Ordering::Relaxed);
    }

    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn broken_frames(&self) -> u64 {
        self.broken_frames.load(Ordering::Relaxed)
    }

    pub fn encode_errors(&self) -> u64 {
        self.encode_errors.load(Ordering::Relaxed)
    }

    pub fn dropped_same(&self) -> u64 {
        self.dropped_same.load(Ordering::Relaxed)
    }

    pub fn dropped_late(&self) -> u64 {
        self.dropped_late.load(Ordering::Relaxed)
    }

    pub fn captured_fps(&self) -> u32 {
        self.captured_fps.lock().current_fps()
    }

    pub fn queued_fps(&self) -> u32 {
        self.queued_fps.lock().current_fps()
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// `/state` JSON shape.
#[derive(Debug, Clone, Serialize)]
pub struct StateReport {
    pub instance_id: String,
    pub encoder: EncoderReport,
    pub source: SourceReport,
    pub stream: StreamReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EncoderReport {
    #[serde(rename = "type")]
    pub kind: String,
    pub quality: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub resolution: String,
    pub format: String,
    pub online: bool,
    pub desired_fps: u32,
    pub captured_fps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamReport {
    pub queued_fps: u32,
    pub clients: u64,
    pub clients_stat: Vec<ClientStat>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStat {
    pub id: String,
    pub fps: u32,
    pub connected_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fps_window() {
        let mut calc = FpsCalculator::new();
        assert_eq!(calc.current_fps(), 0);
        for _ in 0..5 {
            calc.record();
        }
        assert_eq!(calc.current_fps(), 5);
    }

    #[test]
    fn test_counters() {
        let stats = PipelineStats::new();
        stats.record_captured();
        stats.record_captured();
        stats.record_published();
        stats.record_dropped_same();
        assert_eq!(stats.captured(), 2);
        assert_eq!(stats.published(), 1);
        assert_eq!(stats.dropped_same(), 1);
        assert!(stats.captured_fps() >= 2);
    }

    #[test]
    fn test_state_report_serializes() {
        let report = StateReport {
            instance_id: "test".into(),
            encoder: EncoderReport {
                kind: "CPU".into(),
                quality: 80,
            },
            source: SourceReport {
                resolution: "640x480".into(),
                format: "YUYV".into(),
                online: true,
                desired_fps: 30,
                captured_fps: 29,
                path: None,
            },
            stream: StreamReport {
                queued_fps: 29,
                clients: 1,
                clients_stat: vec![],
            },
            cmdline: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["encoder"]["type"], "CPU");
        assert_eq!(json["source"]["online"], true);
        assert!(json.get("cmdline").is_none());
    }
}
