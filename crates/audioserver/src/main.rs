use anyhow::Context;
use std::{net::SocketAddr, sync::Arc};
use vid2audio_server::{
    config::Config,
    registry::JobRegistry,
    routes::{build_router, AppState},
    tools::{Ffmpeg, YtDlp},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    config.ensure_dirs()?;

    let ffmpeg = Ffmpeg::new(config.ffmpeg_path.clone());
    let ffmpeg_found = ffmpeg.detect();
    if !ffmpeg_found {
        tracing::warn!(
            program = ffmpeg.program(),
            "ffmpeg not found; conversions will fail until it is installed"
        );
    }
    let downloader = YtDlp::new(config.downloader_candidates.clone(), config.download_timeout);

    tracing::info!(
        uploads = %config.upload_dir.display(),
        output = %config.output_dir.display(),
        strategy = ?config.output_strategy,
        "storage ready"
    );

    let addr = SocketAddr::new(config.host, config.port);
    let state = AppState::new(config, Arc::new(ffmpeg), Arc::new(downloader), ffmpeg_found);
    let registry = state.registry.clone();
    let app = build_router(state);

    tracing::info!("audioserver listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await
        .context("audioserver failed")?;
    Ok(())
}

/// Waits for Ctrl-C or SIGTERM, then kills every running tool.
async fn shutdown_signal(registry: JobRegistry) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let cancelled = registry.cancel_all();
    tracing::info!(cancelled, "shutting down");
}
