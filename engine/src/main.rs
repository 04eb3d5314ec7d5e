use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use dotenvy::dotenv;
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use engine::{
    AppState,
    config::load_config,
    pipeline::ReportPipeline,
    routes,
    storage::{
        JsonTradelineStorage, JsonTradelineStorageConfig, TradelineStorage,
    },
};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(error = %err, "Backend crashed");
        eprintln!("Backend crashed: {err}");
    }
}

async fn run() -> Result<()> {
    init_tracing();
    if let Err(err) = dotenv() {
        // A missing .env file is normal outside local development.
        info!(error = %err, "no .env file loaded");
    }

    let config = load_config()
        .await
        .context("Failed to load application configuration")?;
    let working_dir = PathBuf::from(&config.working_dir);

    let storage: Arc<dyn TradelineStorage> =
        Arc::new(JsonTradelineStorage::new(JsonTradelineStorageConfig {
            working_dir: working_dir.clone(),
        }));
    storage.initialize().await?;

    let shutdown = CancellationToken::new();
    let pipeline = Arc::new(ReportPipeline::new(
        config.pipeline.clone(),
        storage.clone(),
        shutdown.clone(),
    ));

    let state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        pipeline,
        storage: storage.clone(),
    });

    let addr_string = format!("{}:{}", config.server.host, config.server.port);
    let addr = addr_string
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid server address: {addr_string}"))?;
    info!(host = %config.server.host, port = config.server.port, "Loaded configuration");

    let app = Router::new()
        .route("/health", get(health))
        .merge(routes::report_routes())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind TCP listener on {addr}"))?;
    info!(%addr, "Backend server listening");

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await;

    if let Err(err) = storage.finalize().await {
        warn!(error = %err, "Failed to finalize storage");
    }

    server_result.context("Server encountered a fatal error")?;
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[inline]
async fn health() -> &'static str {
    "ok"
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                if stream.recv().await.is_some() {
                    info!("Received SIGTERM");
                }
            }
            Err(err) => warn!(error = %err, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received termination signal (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received termination signal (SIGTERM)");
        }
    }

    // New uploads are refused while in-flight runs drain.
    shutdown.cancel();
}
