use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dialogue_server::{
    api::{self, AppState},
    config::ServerConfig,
    inference::{DialogueService, TextGenerator},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    info!("🚀 Starting dialogue server for {}", config.model.model_id);

    // -----------------------------
    // Model (blocking: hub download + mmap)
    // -----------------------------
    let model_cfg = config.model.clone();
    let service = tokio::task::spawn_blocking(move || DialogueService::load(&model_cfg))
        .await
        .context("model loading task failed")??;
    let generator: Arc<dyn TextGenerator> = Arc::new(service);

    let state = AppState::new(
        generator,
        config.generation.clone(),
        config.max_message_chars,
    );
    let app = api::router(state, &config.allowed_origins)?;

    let addr = config.bind_addr();
    info!("🌐 HTTP listening on http://{addr}");
    info!("allowed origins: {}", config.allowed_origins.join(", "));

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
