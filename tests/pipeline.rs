//! End-to-end tests: full pipeline over live HTTP with the synthetic
//! pattern source.

use std::time::{Duration, Instant};

use mjpeg_httpd::config::Config;
use mjpeg_httpd::http;
use mjpeg_httpd::pipeline::Pipeline;
use mjpeg_httpd::video::Resolution;
use tokio::sync::oneshot;

/// A live server on an ephemeral port, torn down on `stop()`.
struct TestServer {
    addr: std::net::SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    serve_task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(config: Config) -> Self {
        let pipeline = Pipeline::start(&config);
        let state = http::AppState::new(&config, &pipeline);
        let router = http::router(state);
        let bound = http::bind(&config).await.expect("bind failed");
        let addr = bound.local_addr().expect("expected a TCP address");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let shutdown = async move {
            let _ = shutdown_rx.await;
            // The coordinator signals EOF to open streams on exit, so
            // the graceful shutdown can complete.
            let _ = tokio::task::spawn_blocking(move || pipeline.shutdown()).await;
        };
        let serve_task = tokio::spawn(async move {
            http::serve(bound, router, shutdown).await.expect("serve failed");
        });

        Self {
            addr,
            shutdown: Some(shutdown_tx),
            serve_task,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.serve_task.await;
    }
}

/// One parsed multipart part.
#[derive(Debug)]
struct Part {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Part {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn timestamp(&self) -> f64 {
        self.header("X-Timestamp").unwrap().parse().unwrap()
    }

    fn online(&self) -> bool {
        self.header("X-UStreamer-Online") == Some("1")
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Pulls complete parts out of the accumulation buffer.
fn drain_parts(buf: &mut Vec<u8>, parts: &mut Vec<Part>) {
    let marker = format!("--{}\r\n", mjpeg_httpd::http::stream::BOUNDARY);
    let marker = marker.as_bytes();
    loop {
        let Some(start) = find(buf, marker) else {
            return;
        };
        let headers_start = start + marker.len();
        let Some(headers_len) = find(&buf[headers_start..], b"\r\n\r\n") else {
            return;
        };

        let headers: Vec<(String, String)> = buf[headers_start..headers_start + headers_len]
            .split(|&b| b == b'\n')
            .filter_map(|line| {
                let line = std::str::from_utf8(line).ok()?.trim_end_matches('\r');
                let (name, value) = line.split_once(": ")?;
                Some((name.to_string(), value.to_string()))
            })
            .collect();

        let content_length: usize = headers
            .iter()
            .find(|(k, _)| k == "Content-Length")
            .and_then(|(_, v)| v.parse().ok())
            .expect("part without Content-Length");

        let body_start = headers_start + headers_len + 4;
        if buf.len() < body_start + content_length + 2 {
            return; // body not fully buffered yet
        }
        let body = buf[body_start..body_start + content_length].to_vec();
        parts.push(Part { headers, body });
        buf.drain(..body_start + content_length);
    }
}

/// Reads parts from a live stream until `count` arrived or the timeout
/// passed.
async fn read_parts(response: &mut reqwest::Response, count: usize, timeout: Duration) -> Vec<Part> {
    let mut buf = Vec::new();
    let mut parts = Vec::new();
    let deadline = Instant::now() + timeout;

    while parts.len() < count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, response.chunk()).await {
            Ok(Ok(Some(chunk))) => {
                buf.extend_from_slice(&chunk);
                drain_parts(&mut buf, &mut parts);
            }
            _ => break,
        }
    }
    parts
}

fn fast_test_config() -> Config {
    Config {
        device: "test://".into(),
        resolution: Resolution::new(160, 120),
        desired_fps: 60,
        ..Config::default()
    }
}

#[tokio::test]
async fn test_stream_delivers_wellformed_parts() {
    let server = TestServer::start(fast_test_config()).await;

    let mut response = reqwest::get(server.url("/stream")).await.unwrap();
    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("multipart/x-mixed-replace"));
    assert!(content_type.contains("boundary="));

    let parts = read_parts(&mut response, 5, Duration::from_secs(5)).await;
    assert!(parts.len() >= 5, "got only {} parts", parts.len());

    let mut last_ts = f64::NEG_INFINITY;
    for part in &parts {
        assert_eq!(part.header("Content-Type"), Some("image/jpeg"));
        assert!(part.online());
        assert_eq!(&part.body[..2], &[0xFF, 0xD8], "body is not a JPEG");
        let ts = part.timestamp();
        assert!(ts > last_ts, "timestamps must advance");
        last_ts = ts;
    }

    server.stop().await;
}

#[tokio::test]
async fn test_snapshot_before_first_frame_returns_503() {
    let config = Config {
        device: "test://?silent=1".into(),
        // Keep the offline overlay out of this window.
        online_window: Duration::from_secs(120),
        offline_refresh: Duration::from_secs(120),
        ..fast_test_config()
    };
    let server = TestServer::start(config).await;

    let response = reqwest::get(server.url("/snapshot")).await.unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(
        response
            .headers()
            .get("X-UStreamer-Online")
            .unwrap()
            .to_str()
            .unwrap(),
        "false"
    );

    server.stop().await;
}

#[tokio::test]
async fn test_snapshot_serves_current_frame() {
    let server = TestServer::start(fast_test_config()).await;

    // Wait out pipeline warm-up.
    let deadline = Instant::now() + Duration::from_secs(5);
    let response = loop {
        let response = reqwest::get(server.url("/snapshot")).await.unwrap();
        if response.status() == 200 {
            break response;
        }
        assert!(Instant::now() < deadline, "snapshot never came up");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "image/jpeg"
    );
    assert!(response.headers().contains_key("X-Timestamp"));
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..2], &[0xFF, 0xD8]);

    server.stop().await;
}

#[tokio::test]
async fn test_state_reports_pipeline() {
    let config = Config {
        expose_path: true,
        fake_resolution: Some(Resolution::new(1920, 1080)),
        allow_origin: "*".into(),
        ..fast_test_config()
    };
    let server = TestServer::start(config).await;

    // Let some frames through first.
    let mut stream = reqwest::get(server.url("/stream")).await.unwrap();
    let _ = read_parts(&mut stream, 3, Duration::from_secs(5)).await;

    let response = reqwest::get(server.url("/state")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );
    let state: serde_json::Value = response.json().await.unwrap();

    assert!(!state["instance_id"].as_str().unwrap().is_empty());
    assert_eq!(state["encoder"]["type"], "CPU");
    assert_eq!(state["encoder"]["quality"], 80);
    assert_eq!(state["source"]["format"], "YUYV");
    assert_eq!(state["source"]["online"], true);
    assert_eq!(state["source"]["resolution"], "1920x1080");
    assert_eq!(state["source"]["path"], "test://");
    assert_eq!(state["source"]["desired_fps"], 60);
    assert!(state["stream"]["queued_fps"].as_u64().unwrap() > 0);
    assert_eq!(state["stream"]["clients"], 1);
    assert_eq!(state["stream"]["clients_stat"].as_array().unwrap().len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_dedup_suppresses_static_source() {
    let config = Config {
        device: "test://?static=1".into(),
        drop_same_frames: 10,
        online_window: Duration::from_secs(5),
        offline_refresh: Duration::from_secs(5),
        ..fast_test_config()
    };
    let server = TestServer::start(config).await;

    let mut response = reqwest::get(server.url("/stream")).await.unwrap();
    let parts = read_parts(&mut response, 100, Duration::from_secs(2)).await;

    // 60 fps for ~2s is ~120 source frames; with a dedup window of 10
    // only the forced keepalives get through.
    assert!(!parts.is_empty(), "keepalive frames must still flow");
    assert!(
        parts.len() <= 30,
        "dedup let {} parts through",
        parts.len()
    );
    for part in &parts {
        assert!(part.online());
    }

    server.stop().await;
}

#[tokio::test]
async fn test_source_loss_publishes_offline_placeholder_then_recovers() {
    let config = Config {
        device: "test://?fail_after=20".into(),
        persistent: true,
        online_window: Duration::from_millis(300),
        offline_refresh: Duration::from_millis(150),
        ..fast_test_config()
    };
    let server = TestServer::start(config).await;

    let mut response = reqwest::get(server.url("/stream")).await.unwrap();
    let parts = read_parts(&mut response, 60, Duration::from_secs(8)).await;

    // The stream must go online -> offline placeholder -> online, all
    // on one connection.
    let flags: Vec<bool> = parts.iter().map(|p| p.online()).collect();
    let first_online = flags.iter().position(|&f| f);
    assert!(first_online.is_some(), "no live frames at all");
    let first_offline = flags.iter().position(|&f| !f);
    assert!(
        first_offline.is_some(),
        "no offline placeholder observed in {} parts",
        flags.len()
    );
    let recovered = flags
        .iter()
        .skip(first_offline.unwrap())
        .position(|&f| f);
    assert!(recovered.is_some(), "stream never came back online");

    // Placeholder parts are real JPEGs too.
    let placeholder = &parts[first_offline.unwrap()];
    assert_eq!(&placeholder.body[..2], &[0xFF, 0xD8]);

    server.stop().await;
}

#[tokio::test]
async fn test_basic_auth_guards_endpoints() {
    let config = Config {
        user: Some("admin".into()),
        passwd: Some("secret".into()),
        ..fast_test_config()
    };
    let server = TestServer::start(config).await;
    let client = reqwest::Client::new();

    for path in ["/state", "/snapshot", "/stream"] {
        let response = client.get(server.url(path)).send().await.unwrap();
        assert_eq!(response.status(), 401, "{} must challenge", path);
        assert!(response.headers().contains_key("www-authenticate"));
    }

    let response = client
        .get(server.url("/state"))
        .basic_auth("admin", Some("secret"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    server.stop().await;
}

#[tokio::test]
async fn test_index_page_served() {
    let server = TestServer::start(fast_test_config()).await;

    let response = reqwest::get(server.url("/")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("/stream"));

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_ends_streams_and_sockets() {
    let server = TestServer::start(fast_test_config()).await;
    let addr = server.addr;

    let mut response = reqwest::get(server.url("/stream")).await.unwrap();
    let parts = read_parts(&mut response, 2, Duration::from_secs(5)).await;
    assert!(parts.len() >= 2);

    server.stop().await;

    // The stream sees EOF rather than hanging.
    let eof = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match response.chunk().await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
    })
    .await;
    assert!(eof.is_ok(), "stream did not end after shutdown");

    // And the listener is gone.
    let connect = tokio::net::TcpStream::connect(addr).await;
    assert!(connect.is_err(), "listener still accepting after shutdown");
}

#[tokio::test]
async fn test_stream_interval_paces_parts() {
    let config = Config {
        stream_interval: Duration::from_millis(200),
        ..fast_test_config()
    };
    let server = TestServer::start(config).await;

    let mut response = reqwest::get(server.url("/stream")).await.unwrap();
    let started = Instant::now();
    let parts = read_parts(&mut response, 4, Duration::from_secs(5)).await;
    let elapsed = started.elapsed();

    assert!(parts.len() >= 4);
    // Three gaps of at least 200ms between four parts.
    assert!(
        elapsed >= Duration::from_millis(500),
        "parts arrived too fast: {:?}",
        elapsed
    );

    server.stop().await;
}
