use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scribe::api::{create_router, AppState};
use scribe::config::Config;
use scribe::decode::Decoder;
use scribe::ocr::{EnginePool, OcrProvider, TesseractFactory};
use scribe::processing::ExtractionOrchestrator;
use scribe::storage::{ArtifactStore, OrphanSweeper};

#[derive(Parser)]
#[command(name = "scribe")]
#[command(about = "Self-hostable OCR extraction service for images and video")]
struct Args {
    /// Remove stale scratch files and exit without serving
    #[arg(long)]
    sweep_only: bool,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "scribe=info,tower_http=debug".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env();

    if config.server.api_keys.is_empty() {
        tracing::warn!("SCRIBE_API_KEYS is not set; extraction routes are open to anyone who can reach them");
    }

    let store = ArtifactStore::open(&config.storage).await?;
    let swept = store.sweep_orphans().await?;
    tracing::info!(removed = swept, "Startup scratch sweep complete");
    if args.sweep_only {
        return Ok(());
    }

    tracing::info!(
        languages = %config.ocr.languages.join("+"),
        pool_size = config.ocr.pool_size,
        "Initializing OCR engine pool..."
    );
    let pool = EnginePool::new(
        Arc::new(TesseractFactory::new(config.ocr.clone())),
        config.ocr.pool_size,
    );
    let warm = pool.clone();
    match tokio::task::spawn_blocking(move || warm.warm_up()).await {
        Ok(Ok(())) => tracing::info!("OCR engine ready"),
        Ok(Err(e)) => tracing::warn!(error = %e, "OCR engine unavailable; frames will fail until it can be created"),
        Err(e) => tracing::warn!(error = %e, "OCR warm-up task failed"),
    }
    let ocr = OcrProvider::new(pool, &config.ocr);

    let decoder = Arc::new(Decoder::new(&config.decoder));
    let orchestrator = ExtractionOrchestrator::new(store.clone(), decoder, ocr, &config);

    let cancel_token = CancellationToken::new();
    let state = AppState::new(config.clone(), orchestrator, cancel_token.child_token());

    tracing::info!(
        "Starting orphan sweeper... (interval={}s)",
        config.storage.orphan_sweep_interval_secs
    );
    let sweeper = OrphanSweeper::new(store, config.storage.orphan_sweep_interval_secs);
    let token = cancel_token.child_token();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Orphan sweeper shutting down...");
                    break;
                }
                _ = tokio::time::sleep(tokio::time::Duration::from_secs(sweeper.interval_secs())) => {
                    if let Err(e) = sweeper.run_once().await {
                        tracing::error!("Orphan sweeper error: {}", e);
                    }
                }
            }
        }
    });

    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Scribe starting on http://{}", addr);
    tracing::info!("  Health check: http://{}/api/v1/health", addr);
    tracing::info!("  API docs:     http://{}/api/v1/docs", addr);
    tracing::info!("  OpenAPI spec: http://{}/api/v1/openapi.json", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel_token))
        .await?;

    Ok(())
}

async fn shutdown_signal(cancel_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received, cancelling in-flight extractions...");
    cancel_token.cancel();
}
