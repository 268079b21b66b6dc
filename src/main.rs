//! MJPEG-over-HTTP streaming server CLI.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use mjpeg_httpd::config::{Cli, Config};
use mjpeg_httpd::error::exit;
use mjpeg_httpd::http;
use mjpeg_httpd::pipeline::Pipeline;

fn main() {
    let cli = Cli::parse();

    // Logging first, so config errors are visible the normal way.
    let directive = mjpeg_httpd::config::LogLevel::parse(&cli.log_level)
        .map(|l| l.directive())
        .unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    fmt().with_env_filter(filter).with_target(false).init();

    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(exit::BAD_CONFIG);
        }
    };

    std::process::exit(run(config));
}

#[tokio::main]
async fn run(config: Config) -> i32 {
    info!(
        device = %config.device,
        resolution = %config.resolution,
        format = %config.format,
        encoder = %config.encoder,
        quality = config.quality,
        "starting"
    );

    // Grab the socket before spinning anything up; a bind failure has
    // its own exit code and should not touch the device.
    let bound = match http::bind(&config).await {
        Ok(bound) => bound,
        Err(e) => {
            error!("{}", e);
            return exit::BIND;
        }
    };

    let pipeline = Pipeline::start(&config);
    let state = http::AppState::new(&config, &pipeline);
    let router = http::router(state);

    let fatal = pipeline.fatal();
    let shutdown = {
        let fatal = fatal.clone();
        async move {
            tokio::select! {
                _ = terminate_signal() => info!("termination signal received"),
                message = fatal.wait() => error!("halting: {}", message),
            }
            // Tear the pipeline down now: the coordinator signals EOF to
            // every session on exit, which lets the graceful shutdown
            // below actually complete instead of waiting on live streams.
            let _ = tokio::task::spawn_blocking(move || pipeline.shutdown()).await;
        }
    };

    let result = http::serve(bound, router, shutdown).await;

    if let Err(e) = result {
        error!("{}", e);
        return exit::FATAL;
    }
    if fatal.get().is_some() {
        return exit::FATAL;
    }
    info!("clean shutdown");
    exit::OK
}

async fn terminate_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
