//! Multipart stream sessions.
//!
//! Each connection runs a session task that waits on its latest-wins
//! mailbox, formats one part per frame and queues it toward the socket.
//! The queue carries a pending-byte count: a client that stops reading
//! first loses frames, and once its unaccepted bytes pass the
//! configured limit the connection is dropped so it cannot pin memory.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::clock;
use crate::stream::ClientGuard;
use crate::video::EncodedFrame;

use super::{authorized, unauthorized, AppState};

/// Fixed ASCII boundary token.
pub const BOUNDARY: &str = "boundarydonotcross";

/// Parts queued toward the socket writer at most; the byte limit is
/// the real backstop, this just bounds the channel itself.
const PART_QUEUE_DEPTH: usize = 32;

pub async fn stream(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&state.config, &headers) {
        return unauthorized();
    }

    let subscriber = state.broadcaster.subscribe();
    let guard = state.broadcaster.register_client();

    // Response headers echo what the stream currently looks like.
    let current = state.broadcaster.current();
    let applied = *state.applied_rx.borrow();
    let online = current.as_ref().map(|f| f.online).unwrap_or(false);
    let (width, height) = current
        .as_ref()
        .map(|f| (f.width, f.height))
        .or_else(|| applied.map(|a| (a.width, a.height)))
        .unwrap_or((state.config.resolution.width, state.config.resolution.height));

    let (tx, mut rx) = mpsc::channel::<Bytes>(PART_QUEUE_DEPTH);
    let pending = Arc::new(AtomicUsize::new(0));

    tokio::spawn(session_loop(
        state.clone(),
        subscriber,
        guard,
        tx,
        Arc::clone(&pending),
    ));

    let body = Body::from_stream(async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            pending.fetch_sub(chunk.len(), Ordering::AcqRel);
            yield Ok::<Bytes, Infallible>(chunk);
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace;boundary={}", BOUNDARY),
        )
        .header(header::CONNECTION, "close")
        .header(header::CACHE_CONTROL, "no-store, no-cache")
        .header("X-UStreamer-Online", if online { "true" } else { "false" })
        .header("X-UStreamer-Width", width)
        .header("X-UStreamer-Height", height)
        .body(body)
        .unwrap()
}

/// One connection's state machine: await frame, send part headers and
/// body, honor the inter-frame interval, unregister on any exit.
async fn session_loop(
    state: AppState,
    mut subscriber: watch::Receiver<u64>,
    guard: ClientGuard,
    tx: mpsc::Sender<Bytes>,
    pending: Arc<AtomicUsize>,
) {
    let limit = state.config.stream_client_buffer;
    let interval = state.config.stream_interval;
    let mut last_seq = 0u64;

    loop {
        let Some(frame) = next_frame(&state, &mut subscriber, last_seq).await else {
            break; // stream over
        };
        last_seq = frame.published_seq;

        match push_part(&tx, &pending, limit, build_part(&frame)) {
            PushOutcome::Sent => {
                state.broadcaster.record_frame_sent(guard.id());
            }
            PushOutcome::Skipped => {
                // Latest-wins: the client just lost this frame.
                debug!(client = %guard.id(), seq = frame.published_seq, "part skipped");
            }
            PushOutcome::OverLimit => {
                info!(
                    client = %guard.id(),
                    pending = pending.load(Ordering::Acquire),
                    limit,
                    "slow client exceeded buffer, dropping connection"
                );
                break;
            }
            PushOutcome::Closed => break,
        }

        if !interval.is_zero() {
            sleep(interval).await;
        }
    }
    // The guard drops here and unregisters the client.
}

/// Blocks on the mailbox until a frame newer than `last_seq` exists.
/// `None` means the stream ended.
async fn next_frame(
    state: &AppState,
    subscriber: &mut watch::Receiver<u64>,
    last_seq: u64,
) -> Option<Arc<EncodedFrame>> {
    loop {
        if state.broadcaster.is_closed() {
            return None;
        }
        if let Some(current) = state.broadcaster.current() {
            if current.published_seq > last_seq {
                return Some(current);
            }
        }
        subscriber.changed().await.ok()?;
    }
}

pub(crate) enum PushOutcome {
    Sent,
    /// The channel was momentarily full; the frame is skipped.
    Skipped,
    /// The client's unaccepted bytes exceed the configured limit.
    OverLimit,
    Closed,
}

/// Queues one part toward the socket, accounting pending bytes.
pub(crate) fn push_part(
    tx: &mpsc::Sender<Bytes>,
    pending: &AtomicUsize,
    limit: usize,
    part: Bytes,
) -> PushOutcome {
    let len = part.len();
    if pending.load(Ordering::Acquire) + len > limit {
        return PushOutcome::OverLimit;
    }
    match tx.try_send(part) {
        Ok(()) => {
            pending.fetch_add(len, Ordering::AcqRel);
            PushOutcome::Sent
        }
        Err(mpsc::error::TrySendError::Full(_)) => PushOutcome::Skipped,
        Err(mpsc::error::TrySendError::Closed(_)) => PushOutcome::Closed,
    }
}

/// One multipart part: boundary, part headers, JPEG payload, CRLF.
pub(crate) fn build_part(frame: &EncodedFrame) -> Bytes {
    let headers = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Timestamp: {}\r\nX-UStreamer-Online: {}\r\n\r\n",
        BOUNDARY,
        frame.data.len(),
        clock::format_ts(frame.grab_ts),
        if frame.online { 1 } else { 0 },
    );
    let mut buf = BytesMut::with_capacity(headers.len() + frame.data.len() + 2);
    buf.extend_from_slice(headers.as_bytes());
    buf.extend_from_slice(&frame.data);
    buf.extend_from_slice(b"\r\n");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::Frame;

    fn frame(payload: &[u8], ts: f64, online: bool) -> EncodedFrame {
        let mut raw = Frame::new();
        raw.width = 8;
        raw.height = 8;
        raw.grab_ts = ts;
        raw.online = online;
        let mut encoded =
            EncodedFrame::from_jpeg(Bytes::copy_from_slice(payload), &raw, 0, 1, ts, ts);
        encoded.published_seq = 1;
        encoded
    }

    #[test]
    fn test_part_wire_format() {
        let part = build_part(&frame(b"JPEGDATA", 1.5, true));
        let expected = format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: 8\r\nX-Timestamp: 1.500000\r\nX-UStreamer-Online: 1\r\n\r\nJPEGDATA\r\n",
            BOUNDARY
        );
        assert_eq!(&part[..], expected.as_bytes());
    }

    #[test]
    fn test_part_offline_flag() {
        let part = build_part(&frame(b"X", 0.0, false));
        let text = String::from_utf8_lossy(&part);
        assert!(text.contains("X-UStreamer-Online: 0\r\n"));
    }

    #[tokio::test]
    async fn test_push_part_accounting() {
        let (tx, mut rx) = mpsc::channel::<Bytes>(2);
        let pending = AtomicUsize::new(0);

        assert!(matches!(
            push_part(&tx, &pending, 100, Bytes::from_static(b"0123456789")),
            PushOutcome::Sent
        ));
        assert_eq!(pending.load(Ordering::Acquire), 10);

        // Over the byte limit: connection must drop.
        assert!(matches!(
            push_part(&tx, &pending, 15, Bytes::from_static(b"0123456789")),
            PushOutcome::OverLimit
        ));

        // Under the limit but channel full: frame skipped.
        assert!(matches!(
            push_part(&tx, &pending, 1000, Bytes::from_static(b"a")),
            PushOutcome::Sent
        ));
        assert!(matches!(
            push_part(&tx, &pending, 1000, Bytes::from_static(b"b")),
            PushOutcome::Skipped
        ));

        // Draining the queue frees pending bytes.
        let chunk = rx.recv().await.unwrap();
        pending.fetch_sub(chunk.len(), Ordering::AcqRel);
        assert_eq!(pending.load(Ordering::Acquire), 1);

        drop(rx);
        assert!(matches!(
            push_part(&tx, &pending, 1000, Bytes::from_static(b"c")),
            PushOutcome::Closed
        ));
    }
}
