//! Bounded raw-frame ring between the capturer and the encode workers.
//!
//! Single producer, multiple consumers. Each slot cycles through
//! Empty -> Filled -> Claimed -> Encoding and back to Empty on release,
//! with the generation counter bumped on every fill. The producer only blocks
//! when every slot is in a worker's hands; a Filled slot nobody claimed
//! yet is reclaimed (its frame dropped) rather than stalling capture.
//!
//! Frame buffers move in and out of the slots by `Option::take`, so the
//! capture copy and the encode run both happen outside the ring lock.

use crate::video::Frame;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Filled,
    Claimed,
    Encoding,
}

/// Why a reader returned its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The frame was encoded and handed to the coordinator.
    Encoded,
    /// The frame was dropped (encode error, shutdown).
    Dropped,
}

struct Slot {
    frame: Option<Frame>,
    state: SlotState,
    /// Bumped on every Empty -> Filled transition; strictly monotonic
    /// per slot.
    generation: u64,
    /// Global fill order; `claim_filled` hands out the oldest first.
    fill_seq: u64,
}

struct RingState {
    slots: Vec<Slot>,
    fill_counter: u64,
    closed: bool,
    /// Filled slots overwritten by the producer because no worker
    /// claimed them in time.
    overwritten: u64,
}

struct Shared {
    state: Mutex<RingState>,
    /// Producer waits here when all slots are Claimed/Encoding.
    producer_cv: Condvar,
    /// Workers wait here for a Filled slot; FIFO among waiters.
    consumer_cv: Condvar,
}

/// Handle to the shared ring. Cheap to clone.
#[derive(Clone)]
pub struct RawRing {
    shared: Arc<Shared>,
}

/// Producer-side guard over one slot's frame buffer.
///
/// Dropping the writer without publishing returns the slot to Empty.
pub struct SlotWriter {
    shared: Arc<Shared>,
    index: usize,
    frame: Option<Frame>,
}

/// Consumer-side guard over one Filled slot.
///
/// Dropping the reader without releasing counts as a drop and returns
/// the slot to Empty, so a panicking worker cannot wedge the producer.
pub struct SlotReader {
    shared: Arc<Shared>,
    index: usize,
    generation: u64,
    frame: Option<Frame>,
}

impl RawRing {
    /// Creates a ring with `buffers` slots (at least 2).
    pub fn new(buffers: usize) -> Self {
        assert!(buffers >= 2, "ring needs at least 2 slots");
        let slots = (0..buffers)
            .map(|_| Slot {
                frame: Some(Frame::new()),
                state: SlotState::Empty,
                generation: 0,
                fill_seq: 0,
            })
            .collect();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RingState {
                    slots,
                    fill_counter: 0,
                    closed: false,
                    overwritten: 0,
                }),
                producer_cv: Condvar::new(),
                consumer_cv: Condvar::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the ring: the producer gets `None` from `acquire_empty`,
    /// and workers drain remaining Filled slots before getting `None`.
    pub fn close(&self) {
        let mut st = self.shared.state.lock();
        st.closed = true;
        self.shared.producer_cv.notify_all();
        self.shared.consumer_cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Frames the producer overwrote because no worker claimed them.
    pub fn overwritten(&self) -> u64 {
        self.shared.state.lock().overwritten
    }

    /// Takes a slot for the producer to fill. Prefers an Empty slot;
    /// otherwise reclaims the oldest unclaimed Filled slot. Blocks only
    /// while every slot is Claimed or Encoding. Returns `None` once the
    /// ring is closed.
    pub fn acquire_empty(&self) -> Option<SlotWriter> {
        let mut st = self.shared.state.lock();
        loop {
            if st.closed {
                return None;
            }

            let empty = st
                .slots
                .iter()
                .position(|s| s.state == SlotState::Empty);
            let index = match empty {
                Some(i) => Some(i),
                None => {
                    // Workers are behind; the oldest unclaimed frame is
                    // already stale, so overwrite it.
                    let stale = st
                        .slots
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| s.state == SlotState::Filled)
                        .min_by_key(|(_, s)| s.fill_seq)
                        .map(|(i, _)| i);
                    if stale.is_some() {
                        st.overwritten += 1;
                    }
                    stale
                }
            };

            if let Some(i) = index {
                st.slots[i].state = SlotState::Empty;
                let frame = st.slots[i].frame.take();
                debug_assert!(frame.is_some(), "slot {} frame missing", i);
                return Some(SlotWriter {
                    shared: Arc::clone(&self.shared),
                    index: i,
                    frame,
                });
            }

            self.shared.producer_cv.wait(&mut st);
        }
    }

    /// Publishes a filled slot: Empty -> Filled, generation bump, one
    /// waiting worker is woken.
    pub fn publish(&self, mut writer: SlotWriter) {
        let frame = writer.frame.take().expect("writer already consumed");
        let mut st = self.shared.state.lock();
        let slot = &mut st.slots[writer.index];
        debug_assert_eq!(slot.state, SlotState::Empty);
        slot.frame = Some(frame);
        slot.state = SlotState::Filled;
        slot.generation += 1;
        st.fill_counter += 1;
        let seq = st.fill_counter;
        st.slots[writer.index].fill_seq = seq;
        drop(st);
        self.shared.consumer_cv.notify_one();
    }

    /// Claims the oldest Filled slot, blocking until one is available.
    /// Returns `None` once the ring is closed and drained.
    pub fn claim_filled(&self) -> Option<SlotReader> {
        let mut st = self.shared.state.lock();
        loop {
            let oldest = st
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.state == SlotState::Filled)
                .min_by_key(|(_, s)| s.fill_seq)
                .map(|(i, _)| i);

            if let Some(i) = oldest {
                st.slots[i].state = SlotState::Claimed;
                let generation = st.slots[i].generation;
                let frame = st.slots[i].frame.take();
                debug_assert!(frame.is_some(), "slot {} frame missing", i);
                return Some(SlotReader {
                    shared: Arc::clone(&self.shared),
                    index: i,
                    generation,
                    frame,
                });
            }

            if st.closed {
                return None;
            }

            self.shared.consumer_cv.wait(&mut st);
        }
    }

    /// Marks a claimed slot as being compressed: Claimed -> Encoding.
    pub fn begin_encode(&self, reader: &SlotReader) {
        let mut st = self.shared.state.lock();
        let slot = &mut st.slots[reader.index];
        debug_assert_eq!(slot.state, SlotState::Claimed);
        slot.state = SlotState::Encoding;
    }

    /// Returns a slot after the worker is done with it, waking the
    /// producer if it was backpressured.
    pub fn release(&self, mut reader: SlotReader, outcome: ReleaseOutcome) {
        let frame = reader.frame.take().expect("reader already consumed");
        let mut st = self.shared.state.lock();
        let slot = &mut st.slots[reader.index];
        debug_assert!(
            matches!(slot.state, SlotState::Claimed | SlotState::Encoding),
            "release from {:?}",
            slot.state
        );
        slot.frame = Some(frame);
        slot.state = SlotState::Empty;
        drop(st);
        trace!(slot = reader.index, ?outcome, "slot released");
        self.shared.producer_cv.notify_one();
    }
}

impl SlotWriter {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn frame_mut(&mut self) -> &mut Frame {
        self.frame.as_mut().expect("writer already consumed")
    }
}

impl Drop for SlotWriter {
    fn drop(&mut self) {
        // Aborted write: the frame goes back and the slot stays Empty.
        if let Some(frame) = self.frame.take() {
            let mut st = self.shared.state.lock();
            let slot = &mut st.slots[self.index];
            slot.frame = Some(frame);
            slot.state = SlotState::Empty;
        }
    }
}

impl SlotReader {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn frame(&self) -> &Frame {
        self.frame.as_ref().expect("reader already consumed")
    }
}

impl Drop for SlotReader {
    fn drop(&mut self) {
        // A reader dropped without release (worker panic) must not wedge
        // the producer.
        if let Some(frame) = self.frame.take() {
            let mut st = self.shared.state.lock();
            let slot = &mut st.slots[self.index];
            slot.frame = Some(frame);
            slot.state = SlotState::Empty;
            drop(st);
            self.shared.producer_cv.notify_one();
        }
    }
}
