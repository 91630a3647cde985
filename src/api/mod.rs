use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{config::GenerationParams, inference::TextGenerator};

pub mod error;
pub mod handlers;
pub mod types;

use handlers::{health, message};

#[derive(Clone)]
pub struct AppState {
    pub generator: Arc<dyn TextGenerator>,
    pub generation: Arc<GenerationParams>,
    pub max_message_chars: usize,
}

impl AppState {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        generation: GenerationParams,
        max_message_chars: usize,
    ) -> Self {
        Self {
            generator,
            generation: Arc::new(generation),
            max_message_chars,
        }
    }
}

/// Public router: `POST /message` plus a liveness check.
pub fn router(state: AppState, allowed_origins: &[String]) -> Result<Router> {
    Ok(Router::new()
        .route("/message", post(message))
        .route("/health", get(health))
        .layer(cors_layer(allowed_origins)?)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// CORS for the configured frontends only.
pub fn cors_layer(allowed_origins: &[String]) -> Result<CorsLayer> {
    let origins = allowed_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).with_context(|| format!("invalid CORS origin '{origin}'"))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]))
}
