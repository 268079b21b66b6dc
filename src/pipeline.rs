//! Pipeline assembly and shutdown ordering.
//!
//! Ownership is strictly top-down: the pipeline owns the capturer, the
//! worker pool and the coordinator; workers get a ring handle and a
//! send-only port to the coordinator and never call back up.

use std::sync::Arc;

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::info;

use crate::capture::{AppliedFormat, CaptureConfig, Capturer, Liveness};
use crate::config::Config;
use crate::encode::pool::worker_count;
use crate::encode::WorkerPool;
use crate::ring::RawRing;
use crate::stream::{Broadcaster, Coordinator, CoordinatorConfig, PipelineStats, PlaceholderCache};

/// First fatal error wins; raising is callable from any thread, waiting
/// is async so the supervisor can race it against signals.
#[derive(Clone)]
pub struct FatalSignal {
    inner: Arc<FatalInner>,
}

struct FatalInner {
    message: Mutex<Option<String>>,
    notify: Notify,
}

impl FatalSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FatalInner {
                message: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    pub fn raise(&self, message: String) {
        let mut slot = self.inner.message.lock();
        if slot.is_none() {
            tracing::error!("fatal: {}", message);
            *slot = Some(message);
            self.inner.notify.notify_waiters();
        }
    }

    pub fn get(&self) -> Option<String> {
        self.inner.message.lock().clone()
    }

    /// Resolves once a fatal error has been raised.
    pub async fn wait(&self) -> String {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(message) = self.get() {
                return message;
            }
            notified.await;
        }
    }
}

impl Default for FatalSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The running capture-ring-encode-serve pipeline.
pub struct Pipeline {
    pub broadcaster: Arc<Broadcaster>,
    pub stats: Arc<PipelineStats>,
    capturer: Capturer,
    pool: Option<WorkerPool>,
    coordinator: Option<Coordinator>,
    fatal: FatalSignal,
}

impl Pipeline {
    /// Spawns the capture thread, the encode workers and the
    /// coordinator.
    pub fn start(config: &Config) -> Self {
        let stats = Arc::new(PipelineStats::new());
        let broadcaster = Broadcaster::new();
        let fatal = FatalSignal::new();

        let ring = RawRing::new(config.buffers as usize);
        let workers = worker_count(config.workers, config.buffers);

        // The channel is bounded so a stalled coordinator backpressures
        // workers instead of queueing stale frames.
        let (coord_tx, coord_rx) = bounded(config.buffers as usize * 2);

        let capturer = Capturer::start(
            CaptureConfig {
                device: config.device.clone(),
                width: config.resolution.width,
                height: config.resolution.height,
                format: config.format,
                fps: config.desired_fps,
                input: config.input,
                standard: config.standard.clone(),
                dv_timings: config.dv_timings,
                persistent: config.persistent,
                buffers: config.buffers,
                open_timeout: std::time::Duration::from_secs(5),
                broken_limit: 50,
            },
            ring.clone(),
            Arc::clone(&stats),
            fatal.clone(),
        );

        let pool = WorkerPool::start(
            workers,
            config.encoder,
            config.quality,
            ring.clone(),
            coord_tx,
            Arc::clone(&stats),
        );

        let coordinator = Coordinator::start(
            CoordinatorConfig {
                drop_same_frames: config.drop_same_frames,
                online_window: config.online_window,
                offline_refresh: config.offline_refresh,
            },
            coord_rx,
            Arc::clone(&broadcaster),
            Arc::clone(&stats),
            PlaceholderCache::new(config.quality),
            capturer.applied_watch(),
            fatal.clone(),
        );

        Self {
            broadcaster,
            stats,
            capturer,
            pool: Some(pool),
            coordinator: Some(coordinator),
            fatal,
        }
    }

    pub fn fatal(&self) -> FatalSignal {
        self.fatal.clone()
    }

    pub fn liveness(&self) -> Liveness {
        self.capturer.liveness()
    }

    pub fn applied(&self) -> Option<AppliedFormat> {
        self.capturer.applied()
    }

    pub fn applied_watch(&self) -> watch::Receiver<Option<AppliedFormat>> {
        self.capturer.applied_watch()
    }

    /// Tears the pipeline down in dependency order: the capturer stops
    /// producing and closes the ring, workers drain their slots and
    /// exit, the coordinator flushes and signals EOF to subscribers.
    pub fn shutdown(mut self) {
        info!("shutting down pipeline");
        self.capturer.close();
        if let Some(pool) = self.pool.take() {
            pool.join();
        }
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.join();
        }
        info!("pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_pipeline_publishes_frames() {
        let mut config = Config::default();
        config.device = "test://".into();
        config.resolution = crate::video::Resolution::new(96, 64);
        config.desired_fps = 120;

        let pipeline = Pipeline::start(&config);

        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if let Some(frame) = pipeline.broadcaster.current() {
                assert!(crate::video::is_valid_jpeg(&frame.data));
                assert!(frame.online);
                assert!(frame.published_seq >= 1);
                break;
            }
            assert!(Instant::now() < deadline, "no frame published");
            std::thread::sleep(Duration::from_millis(10));
        }

        let broadcaster = Arc::clone(&pipeline.broadcaster);
        pipeline.shutdown();
        assert!(broadcaster.is_closed());
    }

    #[tokio::test]
    async fn test_fatal_signal() {
        let fatal = FatalSignal::new();
        let waiter = fatal.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        fatal.raise("boom".into());
        fatal.raise("second is ignored".into());
        assert_eq!(task.await.unwrap(), "boom");
        assert_eq!(fatal.get().as_deref(), Some("boom"));
    }
}
