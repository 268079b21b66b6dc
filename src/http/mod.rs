//! HTTP server: routes, bind, CORS, basic auth.

pub mod handlers;
pub mod stream;

use std::future::Future;
use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::info;
use uuid::Uuid;

use crate::capture::AppliedFormat;
use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::stream::{Broadcaster, PipelineStats};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub broadcaster: Arc<Broadcaster>,
    pub stats: Arc<PipelineStats>,
    pub applied_rx: watch::Receiver<Option<AppliedFormat>>,
    pub instance_id: String,
}

impl AppState {
    pub fn new(config: &Config, pipeline: &Pipeline) -> Self {
        Self {
            config: Arc::new(config.clone()),
            broadcaster: Arc::clone(&pipeline.broadcaster),
            stats: Arc::clone(&pipeline.stats),
            applied_rx: pipeline.applied_watch(),
            instance_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Builds the route table. CORS applies to the API routes only; the
/// index (or a user-provided static directory) stays plain.
pub fn router(state: AppState) -> Router {
    let mut api = Router::new()
        .route("/state", get(handlers::state))
        .route("/snapshot", get(handlers::snapshot))
        .route("/stream", get(stream::stream));

    if !state.config.allow_origin.is_empty() {
        api = api.layer(cors_layer(&state.config.allow_origin));
    }

    let root = match &state.config.static_dir {
        Some(dir) => Router::new().fallback_service(ServeDir::new(dir)),
        None => Router::new().route("/", get(handlers::index)),
    };

    root.merge(api).with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    if origin == "*" {
        return CorsLayer::new().allow_origin(Any);
    }
    match HeaderValue::from_str(origin) {
        Ok(value) => CorsLayer::new().allow_origin(value),
        Err(_) => CorsLayer::new(),
    }
}

/// A bound listen socket, TCP or Unix.
pub enum Bound {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl Bound {
    /// The bound TCP address, for ephemeral-port tests.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Bound::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Bound::Unix(_) => None,
        }
    }
}

/// Acquires the listen socket. A failure here is fatal with its own
/// exit code, so the error carries the address it tried.
pub async fn bind(config: &Config) -> Result<Bound, ServerError> {
    #[cfg(unix)]
    if let Some(path) = &config.unix {
        // Stale socket files from a previous run would fail the bind.
        let _ = std::fs::remove_file(path);
        let listener =
            tokio::net::UnixListener::bind(path).map_err(|source| ServerError::Bind {
                address: path.display().to_string(),
                source,
            })?;
        info!(socket = %path.display(), "listening on unix socket");
        return Ok(Bound::Unix(listener));
    }

    let address = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|source| ServerError::Bind {
            address: address.clone(),
            source,
        })?;
    info!(address = %address, "listening");
    Ok(Bound::Tcp(listener))
}

/// Serves until the shutdown future resolves, then closes gracefully.
pub async fn serve<F>(bound: Bound, router: Router, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    match bound {
        Bound::Tcp(listener) => {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await?
        }
        #[cfg(unix)]
        Bound::Unix(listener) => {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await?
        }
    }
    Ok(())
}

/// Checks HTTP basic auth when `--user` is configured.
pub(crate) fn authorized(config: &Config, headers: &HeaderMap) -> bool {
    let Some(user) = &config.user else {
        return true;
    };
    let expected = format!("{}:{}", user, config.passwd.as_deref().unwrap_or(""));

    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    BASE64
        .decode(encoded.trim())
        .map(|decoded| decoded == expected.as_bytes())
        .unwrap_or(false)
}

pub(crate) fn unauthorized() -> Response {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(header::WWW_AUTHENTICATE, "Basic realm=\"mjpeg-httpd\"")
        .body(axum::body::Body::empty())
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_open_without_user() {
        let config = Config::default();
        assert!(authorized(&config, &HeaderMap::new()));
    }

    #[test]
    fn test_auth_checks_credentials() {
        let mut config = Config::default();
        config.user = Some("admin".into());
        config.passwd = Some("secret".into());

        assert!(!authorized(&config, &HeaderMap::new()));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", BASE64.encode("admin:secret"))).unwrap(),
        );
        assert!(authorized(&config, &headers));

        let mut wrong = HeaderMap::new();
        wrong.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", BASE64.encode("admin:nope"))).unwrap(),
        );
        assert!(!authorized(&config, &wrong));
    }

    #[test]
    fn test_unauthorized_challenge() {
        let response = unauthorized();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }
}
