//! Capturer: drives a [`CaptureSource`] and pumps raw frames into the
//! ring.
//!
//! The pump runs on its own OS thread and owns the source exclusively.
//! Device loss and transient errors are contained here and turn into
//! retries with capped exponential backoff; only a non-persistent
//! device loss (or an impossible configuration) escalates to the
//! supervisor.

pub mod pattern;
pub mod source;
#[cfg(target_os = "linux")]
pub mod v4l2;

pub use source::{open_source, AppliedFormat, CaptureSource, DvTimings, Grab, SourceRequest};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock;
use crate::error::SourceError;
use crate::pipeline::FatalSignal;
use crate::ring::RawRing;
use crate::stream::stats::PipelineStats;
use crate::video::PixelFormat;

/// Backoff after a failed probe or a lost source.
const RETRY_BACKOFF_MIN: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Liveness as seen by the rest of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Online,
    Offline,
    Reconnecting,
}

/// Pump states. `Resizing` re-probes immediately with fresh geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpState {
    Probing,
    Streaming,
    SourceLost,
    Resizing,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps: u32,
    pub input: Option<u32>,
    pub standard: Option<String>,
    pub dv_timings: DvTimings,
    /// Keep retrying on device loss instead of exiting.
    pub persistent: bool,
    pub buffers: u32,
    /// How long to wait for the first frame after a successful open.
    pub open_timeout: Duration,
    /// Consecutive broken frames before the source counts as lost.
    pub broken_limit: u32,
}

/// Handle over the capture thread.
pub struct Capturer {
    stop: Arc<AtomicBool>,
    ring: RawRing,
    handle: Option<JoinHandle<()>>,
    liveness_rx: watch::Receiver<Liveness>,
    applied_rx: watch::Receiver<Option<AppliedFormat>>,
}

impl Capturer {
    /// Spawns the pump thread.
    pub fn start(
        config: CaptureConfig,
        ring: RawRing,
        stats: Arc<PipelineStats>,
        fatal: FatalSignal,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let (liveness_tx, liveness_rx) = watch::channel(Liveness::Reconnecting);
        let (applied_tx, applied_rx) = watch::channel(None);

        let pump = Pump {
            config,
            ring: ring.clone(),
            stats,
            fatal,
            stop: Arc::clone(&stop),
            liveness_tx,
            applied_tx,
        };

        let handle = thread::Builder::new()
            .name("capture".into())
            .spawn(move || pump.run())
            .expect("failed to spawn capture thread");

        Self {
            stop,
            ring,
            handle: Some(handle),
            liveness_rx,
            applied_rx,
        }
    }

    pub fn liveness(&self) -> Liveness {
        *self.liveness_rx.borrow()
    }

    pub fn liveness_watch(&self) -> watch::Receiver<Liveness> {
        self.liveness_rx.clone()
    }

    /// The format the source actually applied, once probing succeeded.
    pub fn applied(&self) -> Option<AppliedFormat> {
        *self.applied_rx.borrow()
    }

    pub fn applied_watch(&self) -> watch::Receiver<Option<AppliedFormat>> {
        self.applied_rx.clone()
    }

    /// Stops the pump and closes the ring so workers drain out.
    /// Idempotent; the source is released before this returns.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.ring.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Capturer {
    fn drop(&mut self) {
        self.close();
    }
}

struct Pump {
    config: CaptureConfig,
    ring: RawRing,
    stats: Arc<PipelineStats>,
    fatal: FatalSignal,
    stop: Arc<AtomicBool>,
    liveness_tx: watch::Sender<Liveness>,
    applied_tx: watch::Sender<Option<AppliedFormat>>,
}

impl Pump {
    fn run(self) {
        let mut source = match open_source(&self.config.device) {
            Ok(source) => source,
            Err(e) => {
                self.fatal.raise(format!("capture source: {}", e));
                let _ = self.liveness_tx.send(Liveness::Offline);
                return;
            }
        };

        self.pump_loop(source.as_mut());

        source.close();
        let _ = self.liveness_tx.send(Liveness::Offline);
        debug!("capture thread exiting");
    }

    fn pump_loop(&self, source: &mut dyn CaptureSource) {
        let request = SourceRequest {
            device: self.config.device.clone(),
            width: self.config.width,
            height: self.config.height,
            format: self.config.format,
            fps: self.config.fps,
            input: self.config.input,
            standard: self.config.standard.clone(),
            dv_timings: self.config.dv_timings,
            buffers: self.config.buffers,
        };

        let mut state = PumpState::Probing;
        let mut backoff = RETRY_BACKOFF_MIN;
        let mut broken_run: u32 = 0;
        let mut first_frame_deadline = Instant::now();
        let mut got_first_frame = false;

        while !self.stop.load(Ordering::Relaxed) {
            match state {
                PumpState::Probing => match source.open(&request) {
                    Ok(applied) => {
                        info!(
                            device = %request.device,
                            resolution = %format!("{}x{}", applied.width, applied.height),
                            format = %applied.format,
                            "capture source opened"
                        );
                        let _ = self.applied_tx.send(Some(applied));
                        state = PumpState::Streaming;
                        broken_run = 0;
                        got_first_frame = false;
                        first_frame_deadline = Instant::now() + self.config.open_timeout;
                    }
                    Err(SourceError::Unsupported(e)) => {
                        self.fatal.raise(format!("capture source: {}", e));
                        return;
                    }
                    Err(SourceError::Gone(e)) if !self.config.persistent => {
                        self.fatal.raise(format!("capture source gone: {}", e));
                        return;
                    }
                    Err(e) => {
                        warn!("probe failed: {}", e);
                        let _ = self.liveness_tx.send(Liveness::Reconnecting);
                        self.sleep_interruptible(backoff);
                        backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                    }
                },

                PumpState::Streaming => {
                    let Some(mut writer) = self.ring.acquire_empty() else {
                        return; // ring closed
                    };

                    match source.grab(writer.frame_mut()) {
                        Ok(Grab::Frame) => {
                            if writer.frame_mut().used() == 0 {
                                drop(writer);
                                self.stats.record_broken_frame();
                                broken_run += 1;
                                if broken_run > self.config.broken_limit {
                                    warn!(
                                        run = broken_run,
                                        "too many consecutive broken frames"
                                    );
                                    state = PumpState::SourceLost;
                                }
                                continue;
                            }

                            let frame = writer.frame_mut();
                            frame.grab_ts = clock::now();
                            frame.online = true;
                            self.ring.publish(writer);
                            self.stats.record_captured();

                            broken_run = 0;
                            backoff = RETRY_BACKOFF_MIN;
                            if !got_first_frame {
                                got_first_frame = true;
                                let _ = self.liveness_tx.send(Liveness::Online);
                            }
                        }
                        Ok(Grab::Timeout) => {
                            drop(writer);
                            if !got_first_frame && Instant::now() > first_frame_deadline {
                                warn!("no first frame within open timeout");
                                state = PumpState::SourceLost;
                            }
                        }
                        Ok(Grab::SourceChanged) => {
                            drop(writer);
                            info!("source geometry changed, renegotiating");
                            state = PumpState::Resizing;
                        }
                        Err(SourceError::Gone(e)) => {
                            drop(writer);
                            if self.config.persistent {
                                warn!("source lost: {}", e);
                                state = PumpState::SourceLost;
                            } else {
                                self.fatal.raise(format!("capture source gone: {}", e));
                                return;
                            }
                        }
                        Err(e) => {
                            drop(writer);
                            debug!("grab error: {}", e);
                            self.stats.record_broken_frame();
                            broken_run += 1;
                            if broken_run > self.config.broken_limit {
                                state = PumpState::SourceLost;
                            }
                        }
                    }
                }

                PumpState::SourceLost => {
                    source.close();
                    let _ = self.liveness_tx.send(Liveness::Reconnecting);
                    self.sleep_interruptible(backoff);
                    backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                    state = PumpState::Probing;
                }

                PumpState::Resizing => {
                    source.close();
                    state = PumpState::Probing;
                }
            }
        }
    }

    /// Backoff sleep that wakes promptly on stop.
    fn sleep_interruptible(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline && !self.stop.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(50).min(deadline - Instant::now()));
        }
    }
}
