//! Index, snapshot and state handlers.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;

use crate::clock;
use crate::stream::stats::{EncoderReport, SourceReport, StateReport, StreamReport};

use super::{authorized, unauthorized, AppState};

pub async fn index() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

/// Single JPEG: the current frame at request time. 503 until the first
/// frame has ever been published.
pub async fn snapshot(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&state.config, &headers) {
        return unauthorized();
    }

    match state.broadcaster.current() {
        Some(frame) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "image/jpeg")
            .header(header::CONTENT_LENGTH, frame.data.len())
            .header("X-UStreamer-Online", if frame.online { "true" } else { "false" })
            .header("X-Timestamp", clock::format_ts(frame.grab_ts))
            .body(Body::from(frame.data.clone()))
            .unwrap(),
        None => Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header("X-UStreamer-Online", "false")
            .body(Body::empty())
            .unwrap(),
    }
}

/// JSON snapshot of configuration, capture state and client stats.
pub async fn state(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&state.config, &headers) {
        return unauthorized();
    }

    let applied = *state.applied_rx.borrow();
    let current = state.broadcaster.current();
    let online = current.as_ref().map(|f| f.online).unwrap_or(false);

    let resolution = match (state.config.fake_resolution, applied) {
        (Some(fake), _) => fake.to_string(),
        (None, Some(applied)) => format!("{}x{}", applied.width, applied.height),
        (None, None) => state.config.resolution.to_string(),
    };
    let format = applied
        .map(|a| a.format.to_string())
        .unwrap_or_else(|| state.config.format.to_string());

    let report = StateReport {
        instance_id: state.instance_id.clone(),
        encoder: EncoderReport {
            kind: state.config.encoder.as_str().to_string(),
            quality: state.config.quality,
        },
        source: SourceReport {
            resolution,
            format,
            online,
            desired_fps: state.config.desired_fps,
            captured_fps: state.stats.captured_fps(),
            path: state
                .config
                .expose_path
                .then(|| state.config.device.clone()),
        },
        stream: StreamReport {
            queued_fps: state.stats.queued_fps(),
            clients: state.broadcaster.client_count(),
            clients_stat: state.broadcaster.clients_stat(),
        },
        cmdline: state.config.expose_cmdline.then(|| {
            std::env::args().collect::<Vec<_>>().join(" ")
        }),
    };

    Json(report).into_response()
}
