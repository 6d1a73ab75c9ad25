use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::{net::TcpListener, task};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use resident_llm_service::{
    AppConfig, LocalGenerator, RemoteGenerator, ServiceMode, TextGenerator,
    TranscriptionService, build_router, build_transcription_router,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(mode = ?config.mode, listen_addr = %config.listen_addr, "starting");

    let router = match config.mode {
        ServiceMode::Local => {
            let startup_config = config.clone();
            let generator =
                task::spawn_blocking(move || LocalGenerator::initialize(&startup_config))
                    .await
                    .context("model startup task failed")??;
            build_router(config.clone(), Arc::new(generator) as Arc<dyn TextGenerator>)
        }
        ServiceMode::Remote => {
            let generator = RemoteGenerator::from_config(&config)?;
            build_router(config.clone(), Arc::new(generator) as Arc<dyn TextGenerator>)
        }
        ServiceMode::Transcribe => {
            let service = TranscriptionService::from_config(&config)?;
            build_transcription_router(config.clone(), Arc::new(service))
        }
    };

    serve(router, &config).await
}

async fn serve(router: Router, config: &AppConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "ctrl-c handler unavailable");
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
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
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
    tracing::info!("shutdown signal received, draining connections");
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
