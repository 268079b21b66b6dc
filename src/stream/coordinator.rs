//! Stream coordinator.
//!
//! Reconciles worker output into the published sequence: admission in
//! grab-timestamp order, frame deduplication over encoded payload
//! hashes, and the online/offline overlay that keeps idle viewers fed
//! with a placeholder while the source is away.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::capture::AppliedFormat;
use crate::clock;
use crate::encode::CoordMsg;
use crate::pipeline::FatalSignal;
use crate::video::EncodedFrame;

use super::broadcast::Broadcaster;
use super::placeholder::PlaceholderCache;
use super::stats::PipelineStats;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Dedup window length; 0 disables deduplication.
    pub drop_same_frames: u32,
    /// How long after the last real frame the stream counts as online.
    pub online_window: Duration,
    /// Placeholder republish interval while offline.
    pub offline_refresh: Duration,
}

/// Ring of recently published payload hashes.
///
/// A candidate matching any remembered hash is dropped and counted as a
/// repeat; once the repeat count reaches the window length the next
/// frame goes through regardless, a periodic keepalive for idle
/// clients.
pub struct DedupRing {
    window: usize,
    hashes: VecDeque<u64>,
    repeats: u32,
}

impl DedupRing {
    pub fn new(window: u32) -> Self {
        Self {
            window: window as usize,
            hashes: VecDeque::with_capacity(window as usize),
            repeats: 0,
        }
    }

    pub fn should_drop(&mut self, hash: u64) -> bool {
        if self.window == 0 {
            return false;
        }
        if self.repeats as usize >= self.window {
            // Forced keepalive publish.
            self.repeats = 0;
            self.remember(hash);
            return false;
        }
        if self.hashes.contains(&hash) {
            self.repeats += 1;
            return true;
        }
        self.repeats = 0;
        self.remember(hash);
        false
    }

    fn remember(&mut self, hash: u64) {
        self.hashes.push_back(hash);
        while self.hashes.len() > self.window {
            self.hashes.pop_front();
        }
    }
}

pub struct Coordinator {
    handle: Option<JoinHandle<()>>,
}

impl Coordinator {
    /// Spawns the coordinator thread.
    pub fn start(
        config: CoordinatorConfig,
        rx: Receiver<CoordMsg>,
        broadcaster: Arc<Broadcaster>,
        stats: Arc<PipelineStats>,
        placeholder: PlaceholderCache,
        applied_rx: watch::Receiver<Option<AppliedFormat>>,
        fatal: FatalSignal,
    ) -> Self {
        let handle = thread::Builder::new()
            .name("coordinator".into())
            .spawn(move || {
                run(config, rx, broadcaster, stats, placeholder, applied_rx, fatal)
            })
            .expect("failed to spawn coordinator thread");
        Self {
            handle: Some(handle),
        }
    }

    /// Waits for the coordinator to exit. Returns once the worker
    /// channel has disconnected and the final notification went out.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    config: CoordinatorConfig,
    rx: Receiver<CoordMsg>,
    broadcaster: Arc<Broadcaster>,
    stats: Arc<PipelineStats>,
    placeholder: PlaceholderCache,
    applied_rx: watch::Receiver<Option<AppliedFormat>>,
    fatal: FatalSignal,
) {
    let mut seq: u64 = 0;
    let mut last_grab_ts = f64::NEG_INFINITY;
    let mut dedup = DedupRing::new(config.drop_same_frames);
    let mut last_real_publish: Option<Instant> = None;
    let mut last_offline_publish: Option<Instant> = None;

    // Poll often enough to keep the offline overlay responsive even
    // with a long refresh interval.
    let tick = config.offline_refresh.min(Duration::from_millis(250));

    loop {
        match rx.recv_timeout(tick) {
            Ok(CoordMsg::Encoded(mut frame)) => {
                // Admission is in grab order: a frame older than what
                // viewers already saw is worthless.
                if frame.grab_ts < last_grab_ts {
                    stats.record_dropped_late();
                    continue;
                }
                if dedup.should_drop(frame.hash) {
                    stats.record_dropped_same();
                    continue;
                }

                last_grab_ts = frame.grab_ts;
                seq += 1;
                frame.published_seq = seq;
                frame.online = true;
                broadcaster.publish(Arc::new(frame));
                stats.record_published();
                last_real_publish = Some(Instant::now());
                last_offline_publish = None;
            }

            Ok(CoordMsg::Fatal(message)) => {
                fatal.raise(message);
                break;
            }

            Err(RecvTimeoutError::Timeout) => {
                let offline = last_real_publish
                    .map(|t| t.elapsed() >= config.online_window)
                    .unwrap_or(true);
                if !offline {
                    continue;
                }

                // Without a negotiated geometry there is nothing
                // sensible to render; snapshot stays 503 until then.
                let Some(applied) = *applied_rx.borrow() else {
                    continue;
                };

                let due = last_offline_publish
                    .map(|t| t.elapsed() >= config.offline_refresh)
                    .unwrap_or(true);
                if !due {
                    continue;
                }

                let jpeg = placeholder.get(applied.width, applied.height);
                let ts = clock::now();
                if ts < last_grab_ts {
                    continue;
                }
                seq += 1;
                last_grab_ts = ts;
                let frame = EncodedFrame {
                    hash: 0,
                    published_seq: seq,
                    data: jpeg.clone(),
                    width: applied.width,
                    height: applied.height,
                    grab_ts: ts,
                    encode_begin_ts: ts,
                    encode_end_ts: ts,
                    online: false,
                    slot_index: 0,
                    generation: 0,
                };
                debug!(seq, "publishing offline placeholder");
                broadcaster.publish(Arc::new(frame));
                last_offline_publish = Some(Instant::now());
            }

            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    broadcaster.close();
    info!("coordinator exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::Frame;
    use bytes::Bytes;
    use crossbeam_channel::bounded;

    fn encoded(grab_ts: f64, payload: &[u8]) -> EncodedFrame {
        let mut raw = Frame::new();
        raw.width = 8;
        raw.height = 8;
        raw.grab_ts = grab_ts;
        raw.online = true;
        EncodedFrame::from_jpeg(Bytes::copy_from_slice(payload), &raw, 0, 1, grab_ts, grab_ts)
    }

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            drop_same_frames: 0,
            online_window: Duration::from_secs(60),
            offline_refresh: Duration::from_secs(60),
        }
    }

    fn wait_for_seq(broadcaster: &Broadcaster, seq: u64) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if broadcaster
                .current()
                .map(|f| f.published_seq >= seq)
                .unwrap_or(false)
            {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("frame {} never published", seq);
    }

    #[test]
    fn test_dedup_ring_window() {
        let mut dedup = DedupRing::new(3);
        assert!(!dedup.should_drop(1)); // first publish
        assert!(dedup.should_drop(1)); // repeat 1
        assert!(dedup.should_drop(1)); // repeat 2
        assert!(dedup.should_drop(1)); // repeat 3, hits the window
        assert!(!dedup.should_drop(1)); // forced keepalive
        assert!(dedup.should_drop(1)); // counting restarts
    }

    #[test]
    fn test_dedup_disabled() {
        let mut dedup = DedupRing::new(0);
        for _ in 0..10 {
            assert!(!dedup.should_drop(7));
        }
    }

    #[test]
    fn test_dedup_change_publishes_immediately() {
        let mut dedup = DedupRing::new(5);
        assert!(!dedup.should_drop(1));
        assert!(dedup.should_drop(1));
        assert!(!dedup.should_drop(2)); // new content goes straight out
        assert!(dedup.should_drop(2));
        assert!(dedup.should_drop(1)); // still in the window
    }

    #[test]
    fn test_publishes_in_grab_order() {
        let (tx, rx) = bounded(8);
        let broadcaster = Broadcaster::new();
        let stats = Arc::new(PipelineStats::new());
        let (_applied_tx, applied_rx) = watch::channel(None);
        let coordinator = Coordinator::start(
            test_config(),
            rx,
            Arc::clone(&broadcaster),
            Arc::clone(&stats),
            PlaceholderCache::new(80),
            applied_rx,
            FatalSignal::new(),
        );

        tx.send(CoordMsg::Encoded(encoded(1.0, b"frame-a"))).unwrap();
        tx.send(CoordMsg::Encoded(encoded(2.0, b"frame-b"))).unwrap();
        // Late frame from a straggler worker: dropped.
        tx.send(CoordMsg::Encoded(encoded(1.5, b"frame-c"))).unwrap();
        tx.send(CoordMsg::Encoded(encoded(3.0, b"frame-d"))).unwrap();

        wait_for_seq(&broadcaster, 3);
        let current = broadcaster.current().unwrap();
        assert_eq!(current.published_seq, 3);
        assert_eq!(&current.data[..], b"frame-d");
        assert_eq!(stats.dropped_late(), 1);
        assert_eq!(stats.published(), 3);

        drop(tx);
        coordinator.join();
        assert!(broadcaster.is_closed());
    }

    #[test]
    fn test_offline_placeholder_published() {
        let (tx, rx) = bounded::<CoordMsg>(8);
        let broadcaster = Broadcaster::new();
        let stats = Arc::new(PipelineStats::new());
        let (applied_tx, applied_rx) = watch::channel(None);
        applied_tx
            .send(Some(AppliedFormat {
                width: 64,
                height: 48,
                format: crate::video::PixelFormat::Yuyv,
                stride: 128,
                fps: 30,
            }))
            .unwrap();

        let config = CoordinatorConfig {
            drop_same_frames: 0,
            online_window: Duration::from_millis(50),
            offline_refresh: Duration::from_millis(50),
        };
        let coordinator = Coordinator::start(
            config,
            rx,
            Arc::clone(&broadcaster),
            stats,
            PlaceholderCache::new(80),
            applied_rx,
            FatalSignal::new(),
        );

        wait_for_seq(&broadcaster, 1);
        let frame = broadcaster.current().unwrap();
        assert!(!frame.online);
        assert_eq!(frame.width, 64);
        assert!(crate::video::is_valid_jpeg(&frame.data));

        // A live frame flips the stream back online.
        tx.send(CoordMsg::Encoded(encoded(clock::now() + 1.0, b"live")))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(f) = broadcaster.current() {
                if f.online {
                    break;
                }
            }
            assert!(Instant::now() < deadline, "live frame never resumed");
            thread::sleep(Duration::from_millis(5));
        }

        drop(tx);
        coordinator.join();
    }

    #[test]
    fn test_fatal_message_raises_signal() {
        let (tx, rx) = bounded(2);
        let broadcaster = Broadcaster::new();
        let fatal = FatalSignal::new();
        let (_applied_tx, applied_rx) = watch::channel(None);
        let coordinator = Coordinator::start(
            test_config(),
            rx,
            Arc::clone(&broadcaster),
            Arc::new(PipelineStats::new()),
            PlaceholderCache::new(80),
            applied_rx,
            fatal.clone(),
        );

        tx.send(CoordMsg::Fatal("pool died".into())).unwrap();
        coordinator.join();
        assert_eq!(fatal.get().as_deref(), Some("pool died"));
        assert!(broadcaster.is_closed());
    }
}
