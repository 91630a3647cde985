use anyhow::anyhow;
use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use std::time::Instant;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use super::{
    error::ApiError,
    types::{HealthResponse, MessageRequest, MessageResponse},
    AppState,
};

pub async fn message(
    State(state): State<AppState>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let request_id = Uuid::new_v4();

    async move {
        let message = message_field(payload)?;
        let text = validate_message(message.as_deref(), state.max_message_chars)?;

        let generator = state.generator.clone();
        let params = state.generation.clone();
        let started = Instant::now();

        let reply = tokio::task::spawn_blocking(move || generator.generate(&text, &params))
            .await
            .map_err(|e| ApiError::Internal(anyhow!("generation task failed: {e}")))?
            .map_err(ApiError::Internal)?;

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            reply_chars = reply.chars().count(),
            "reply generated"
        );

        Ok(Json(MessageResponse { response: reply }))
    }
    .instrument(info_span!("message", %request_id))
    .await
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model: state.generator.model_id().to_string(),
    })
}

/// Pull `message` out of the body. A body over the size limit counts as a
/// too-long message; anything that is not a JSON object counts as empty.
fn message_field(
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Option<String>, ApiError> {
    let Json(body) = payload.map_err(|rejection| match rejection {
        JsonRejection::BytesRejection(_) => ApiError::MessageTooLong,
        _ => ApiError::EmptyMessage,
    })?;
    if !body.is_object() {
        return Err(ApiError::EmptyMessage);
    }

    let req: MessageRequest =
        serde_json::from_value(body).map_err(|_| ApiError::InvalidMessage)?;
    Ok(req.message)
}

/// Trim the message and enforce the non-empty and length rules.
pub fn validate_message(raw: Option<&str>, max_chars: usize) -> Result<String, ApiError> {
    let text = raw.map(str::trim).unwrap_or_default();
    if text.is_empty() {
        return Err(ApiError::EmptyMessage);
    }
    if text.chars().count() > max_chars {
        return Err(ApiError::MessageTooLong);
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_object_bodies_count_as_empty() {
        for body in [json!(null), json!("hello"), json!([1, 2]), json!(7)] {
            assert!(matches!(
                message_field(Ok(Json(body))),
                Err(ApiError::EmptyMessage)
            ));
        }
    }

    #[test]
    fn object_bodies_yield_the_message_field() {
        assert_eq!(
            message_field(Ok(Json(json!({ "message": "hi" })))).unwrap(),
            Some("hi".to_string())
        );
        assert_eq!(message_field(Ok(Json(json!({ "message": null })))).unwrap(), None);
        assert!(matches!(
            message_field(Ok(Json(json!({ "message": ["hi"] })))),
            Err(ApiError::InvalidMessage)
        ));
    }

    #[test]
    fn trims_surrounding_whitespace() {
        assert_eq!(validate_message(Some("  hi \n"), 500).unwrap(), "hi");
    }

    #[test]
    fn missing_and_blank_messages_are_empty() {
        assert!(matches!(validate_message(None, 500), Err(ApiError::EmptyMessage)));
        assert!(matches!(validate_message(Some(""), 500), Err(ApiError::EmptyMessage)));
        assert!(matches!(validate_message(Some(" \t\n "), 500), Err(ApiError::EmptyMessage)));
    }

    #[test]
    fn length_bound_counts_characters_after_trim() {
        let exact = "é".repeat(500);
        assert!(validate_message(Some(&exact), 500).is_ok());

        let padded = format!("   {exact}   ");
        assert!(validate_message(Some(&padded), 500).is_ok());

        let over = "a".repeat(501);
        assert!(matches!(validate_message(Some(&over), 500), Err(ApiError::MessageTooLong)));
    }
}
