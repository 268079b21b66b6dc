//! Raw and encoded frame buffers.

use bytes::Bytes;
use xxhash_rust::xxh64::xxh64;

use super::format::PixelFormat;

/// Minimum plausible size for a compressed frame, in bytes.
const MIN_JPEG_SIZE: usize = 125;

/// An owned raw frame: one buffer plus its header fields.
///
/// The buffer is reused across ring generations; `used` tracks how many
/// bytes of `data` are valid for the current frame.
#[derive(Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Bytes per row for packed raw formats, 0 for compressed payloads.
    pub stride: u32,
    /// Monotonic seconds at the moment the driver handed the frame over.
    pub grab_ts: f64,
    pub encode_begin_ts: f64,
    pub encode_end_ts: f64,
    pub online: bool,
    pub key: bool,
    /// GOP length, 0 for non-video-coded content.
    pub gop: u32,
    /// Opaque DMA buffer handle, passed through to hardware encoders.
    pub dma: Option<u64>,
    data: Vec<u8>,
    used: usize,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            format: PixelFormat::Yuyv,
            stride: 0,
            grab_ts: 0.0,
            encode_begin_ts: 0.0,
            encode_end_ts: 0.0,
            online: false,
            key: false,
            gop: 0,
            dma: None,
            data: Vec::new(),
            used: 0,
        }
    }

    /// Grows the buffer if needed. Steady-state captures into an
    /// already-sized buffer and never allocate.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if self.data.len() < capacity {
            self.data.resize(capacity, 0);
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Valid payload bytes.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Marks `used` bytes of the buffer as valid. Clamped to capacity so
    /// the `used <= capacity` invariant holds.
    pub fn set_used(&mut self, used: usize) {
        self.used = used.min(self.data.len());
    }

    /// The valid payload.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// The whole buffer, for drivers that fill it in place.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copies a payload in, growing the buffer on geometry changes only.
    pub fn write_from(&mut self, src: &[u8]) {
        self.ensure_capacity(src.len());
        self.data[..src.len()].copy_from_slice(src);
        self.used = src.len();
    }

    /// Checks the raw-format size invariant: a packed frame must fit
    /// `stride * height` rows inside the buffer.
    pub fn raw_geometry_ok(&self) -> bool {
        if self.format.is_compressed() {
            return true;
        }
        (self.stride as usize) * (self.height as usize) <= self.data.len()
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

/// A published JPEG frame, shared immutably across all subscribers.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// JPEG payload.
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub grab_ts: f64,
    pub encode_begin_ts: f64,
    pub encode_end_ts: f64,
    pub online: bool,
    /// Raw-ring back-reference.
    pub slot_index: usize,
    pub generation: u64,
    /// Assigned by the coordinator on admit; 0 until published.
    pub published_seq: u64,
    /// xxh64 of the payload, used for frame deduplication.
    pub hash: u64,
}

impl EncodedFrame {
    /// Wraps an encoded payload, carrying header fields over from the
    /// raw frame it came from.
    pub fn from_jpeg(
        payload: Bytes,
        raw: &Frame,
        slot_index: usize,
        generation: u64,
        encode_begin_ts: f64,
        encode_end_ts: f64,
    ) -> Self {
        let hash = xxh64(&payload, 0);
        Self {
            data: payload,
            width: raw.width,
            height: raw.height,
            grab_ts: raw.grab_ts,
            encode_begin_ts,
            encode_end_ts,
            online: raw.online,
            slot_index,
            generation,
            published_seq: 0,
            hash,
        }
    }
}

/// Validates JPEG start/end markers.
pub fn is_valid_jpeg(data: &[u8]) -> bool {
    if data.len() < MIN_JPEG_SIZE {
        return false;
    }

    if data[0] != 0xFF || data[1] != 0xD8 {
        return false;
    }

    let end = data.len();
    let end_marker = ((data[end - 2] as u16) << 8) | data[end - 1] as u16;

    // Some hardware pads the tail; accept padded endings too.
    matches!(end_marker, 0xFFD9 | 0xD900 | 0x0000)
}
