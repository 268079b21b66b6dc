//! Encode worker pool.
//!
//! Each worker claims the oldest filled ring slot, compresses it with
//! its own encoder instance, hands the result to the coordinator and
//! releases the slot. Workers exit when the ring closes and drains.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::Sender;
use tracing::{debug, error, info};

use crate::clock;
use crate::ring::{RawRing, ReleaseOutcome};
use crate::stream::stats::PipelineStats;
use crate::video::EncodedFrame;

use super::{Encoder, EncoderKind, FallbackEncoder, FATAL_ENCODER_LIMIT};

/// Worker-to-coordinator messages.
pub enum CoordMsg {
    Encoded(EncodedFrame),
    /// A worker is beyond recovery; the pipeline must halt.
    Fatal(String),
}

/// Caps the worker count: at least one, and always leaving the
/// producer a free slot.
pub fn worker_count(hint: u32, buffers: u32) -> usize {
    hint.clamp(1, buffers.saturating_sub(1).max(1)) as usize
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` workers, each with its own encoder.
    pub fn start(
        count: usize,
        kind: EncoderKind,
        quality: u8,
        ring: RawRing,
        tx: Sender<CoordMsg>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        info!(workers = count, encoder = %kind, quality, "starting encode workers");
        let handles = (0..count)
            .map(|id| {
                let worker = Worker {
                    id,
                    ring: ring.clone(),
                    tx: tx.clone(),
                    encoder: FallbackEncoder::new(kind, quality),
                    stats: Arc::clone(&stats),
                    out: Vec::new(),
                    consecutive_errors: 0,
                };
                thread::Builder::new()
                    .name(format!("encoder-{}", id))
                    .spawn(move || worker.run())
                    .expect("failed to spawn encode worker")
            })
            .collect();
        Self { handles }
    }

    /// Waits for every worker to exit. Call after closing the ring.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

struct Worker {
    id: usize,
    ring: RawRing,
    tx: Sender<CoordMsg>,
    encoder: FallbackEncoder,
    stats: Arc<PipelineStats>,
    out: Vec<u8>,
    consecutive_errors: u32,
}

impl Worker {
    fn run(mut self) {
        debug!(worker = self.id, "encode worker started");

        while let Some(reader) = self.ring.claim_filled() {
            self.ring.begin_encode(&reader);
            let encode_begin_ts = clock::now();

            match self.encoder.encode(reader.frame(), &mut self.out) {
                Ok(()) => {
                    self.consecutive_errors = 0;
                    let encode_end_ts = clock::now();
                    let encoded = EncodedFrame::from_jpeg(
                        Bytes::copy_from_slice(&self.out),
                        reader.frame(),
                        reader.index(),
                        reader.generation(),
                        encode_begin_ts,
                        encode_end_ts,
                    );
                    let sent = self.tx.send(CoordMsg::Encoded(encoded)).is_ok();
                    self.ring.release(reader, ReleaseOutcome::Encoded);
                    if !sent {
                        break; // coordinator is gone
                    }
                }
                Err(e) => {
                    // A single bad frame is dropped and counted.
                    debug!(worker = self.id, error = %e, "frame encode failed");
                    self.stats.record_encode_error();
                    self.ring.release(reader, ReleaseOutcome::Dropped);

                    self.consecutive_errors += 1;
                    if self.consecutive_errors >= FATAL_ENCODER_LIMIT {
                        if self.encoder.downgrade_to_cpu() {
                            self.consecutive_errors = 0;
                        } else {
                            error!(
                                worker = self.id,
                                "CPU encoder failing repeatedly, halting pool"
                            );
                            let _ = self.tx.send(CoordMsg::Fatal(format!(
                                "worker {} encoder failed {} times in a row",
                                self.id, FATAL_ENCODER_LIMIT
                            )));
                            return;
                        }
                    }
                }
            }
        }

        debug!(worker = self.id, "encode worker exiting");
    }
}
