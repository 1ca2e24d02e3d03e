//! `/api/sessions/*` routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
};

use {
    campusline_broker::{InitOutcome, MediaKind, SendReceipt},
    serde::Deserialize,
    tracing::info,
};

use crate::{
    error::{ApiError, InitError, not_found},
    state::AppState,
};

pub fn sessions_router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_handler))
        .route("/{tenant_id}/initialize", post(initialize_handler))
        .route("/{tenant_id}/status", get(status_handler))
        .route("/{tenant_id}/send", post(send_text_handler))
        .route("/{tenant_id}/send-media", post(send_media_handler))
        .route("/{tenant_id}/disconnect", post(disconnect_handler))
}

async fn initialize_handler(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<InitOutcome>, InitError> {
    info!(tenant_id, "initialize requested");
    state
        .broker
        .initialize(&tenant_id)
        .await
        .map(Json)
        .map_err(InitError)
}

async fn status_handler(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Response {
    let Some(snapshot) = state.broker.status(&tenant_id) else {
        return not_found(&tenant_id);
    };
    let connection = snapshot.connection.as_ref();
    Json(serde_json::json!({
        "connected": snapshot.is_connected(),
        "state": snapshot.state,
        "phone_address": connection.map(|c| c.address.as_str()),
        "display_name": connection.and_then(|c| c.display_name.as_deref()),
        "last_seen_at": connection.map(|c| c.last_seen_at),
        "pairing_image": snapshot.pairing_image,
        "initialization_in_flight": snapshot.initialization_in_flight,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct SendTextRequest {
    recipient: String,
    text: String,
}

async fn send_text_handler(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(body): Json<SendTextRequest>,
) -> Result<Json<SendReceipt>, ApiError> {
    let receipt = state
        .broker
        .send_text(&tenant_id, &body.recipient, &body.text)
        .await?;
    Ok(Json(receipt))
}

#[derive(Debug, Deserialize)]
struct SendMediaRequest {
    recipient: String,
    media_url: String,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    kind: MediaKind,
}

async fn send_media_handler(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(body): Json<SendMediaRequest>,
) -> Result<Json<SendReceipt>, ApiError> {
    let receipt = state
        .broker
        .send_media(
            &tenant_id,
            &body.recipient,
            &body.media_url,
            body.caption.as_deref(),
            body.kind,
        )
        .await?;
    Ok(Json(receipt))
}

async fn disconnect_handler(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    info!(tenant_id, "disconnect requested");
    let success = state.broker.disconnect(&tenant_id).await;
    Json(serde_json::json!({ "success": success }))
}

async fn list_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "tenants": state.broker.list_active() }))
}
