use hlsd::logging::init_logging;
use hlsd::{OrchestratorConfig, SessionOrchestrator};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = OrchestratorConfig::from_env_or_default();
    let (logging, _guard) = init_logging(config.log_dir.as_deref())?;
    config.validate()?;

    let background = CancellationToken::new();
    logging.start_retention_cleanup(background.clone());

    let orchestrator = SessionOrchestrator::from_config(config)?;
    orchestrator.artifacts().ensure_base_dir().await?;

    let deps = orchestrator.dependency_status();
    if !deps.all_available() {
        warn!(ffmpeg = deps.ffmpeg, ffprobe = deps.ffprobe, mpv = deps.mpv, "Some external tools are missing");
    }

    let config = orchestrator.config();
    info!(
        streams_dir = %config.streams_base_dir.display(),
        content_api = %config.content_api_base_url,
        max_sessions = config.max_concurrent_sessions,
        "hlsd started"
    );

    orchestrator.spawn_reaper();
    shutdown_signal().await?;

    info!("Shutting down");
    background.cancel();
    orchestrator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
