//! Broadcaster: fans the current frame out to subscribers.
//!
//! The current frame lives in an `ArcSwap` so readers never block a
//! publish, and the notification channel is a `watch` whose single slot
//! gives every subscriber latest-wins semantics: a slow client loses
//! frames, it never stalls the coordinator. A registry of client
//! sessions feeds `/state`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::video::EncodedFrame;

use super::stats::{ClientStat, FpsCalculator};

struct ClientSession {
    connected_at: Instant,
    frames_sent: u64,
    fps: FpsCalculator,
}

pub struct Broadcaster {
    current: ArcSwapOption<EncodedFrame>,
    seq_tx: watch::Sender<u64>,
    clients: RwLock<HashMap<String, ClientSession>>,
    shutdown: AtomicBool,
}

impl Broadcaster {
    pub fn new() -> Arc<Self> {
        let (seq_tx, _) = watch::channel(0);
        Arc::new(Self {
            current: ArcSwapOption::from(None),
            seq_tx,
            clients: RwLock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Swaps the current frame and notifies every subscriber. Readers
    /// see either the old or the new frame, never a torn state.
    pub fn publish(&self, frame: Arc<EncodedFrame>) {
        let seq = frame.published_seq;
        self.current.store(Some(frame));
        self.seq_tx.send_replace(seq);
    }

    /// The most recently published frame, if any.
    pub fn current(&self) -> Option<Arc<EncodedFrame>> {
        self.current.load_full()
    }

    /// A latest-wins mailbox carrying the newest published sequence.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.seq_tx.subscribe()
    }

    /// Marks the end of the stream and wakes all subscribers so their
    /// sessions can close.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // send_modify notifies even though the value is unchanged.
        self.seq_tx.send_modify(|_| {});
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Registers an HTTP session (or sink) for `/state` accounting.
    /// The returned guard unregisters on drop.
    pub fn register_client(self: &Arc<Self>) -> ClientGuard {
        let id = Uuid::new_v4().to_string();
        self.clients.write().insert(
            id.clone(),
            ClientSession {
                connected_at: Instant::now(),
                frames_sent: 0,
                fps: FpsCalculator::new(),
            },
        );
        info!(client = %id, total = self.client_count(), "stream client connected");
        ClientGuard {
            id,
            broadcaster: Arc::clone(self),
        }
    }

    fn unregister_client(&self, id: &str) {
        if let Some(session) = self.clients.write().remove(id) {
            let secs = session.connected_at.elapsed().as_secs_f32();
            info!(
                client = %id,
                frames = session.frames_sent,
                duration_secs = %format!("{:.1}", secs),
                "stream client disconnected"
            );
        }
    }

    pub fn record_frame_sent(&self, id: &str) {
        if let Some(session) = self.clients.write().get_mut(id) {
            session.frames_sent += 1;
            session.fps.record();
        }
    }

    pub fn client_count(&self) -> u64 {
        self.clients.read().len() as u64
    }

    pub fn clients_stat(&self) -> Vec<ClientStat> {
        self.clients
            .read()
            .iter()
            .map(|(id, session)| ClientStat {
                id: id.clone(),
                fps: session.fps.current_fps(),
                connected_secs: session.connected_at.elapsed().as_secs(),
            })
            .collect()
    }
}

/// RAII client registration; cleanup happens even when a session task
/// panics or the connection is torn down mid-frame.
pub struct ClientGuard {
    id: String,
    broadcaster: Arc<Broadcaster>,
}

impl ClientGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        debug!(client = %self.id, "unregistering stream client");
        self.broadcaster.unregister_client(&self.id);
    }
}
