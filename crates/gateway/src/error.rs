//! HTTP mapping of broker errors.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use campusline_broker::Error;

/// HTTP status for each broker error kind.
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::AlreadyInitializing { .. }
        | Error::NotConnected { .. }
        | Error::SessionClosed { .. } => StatusCode::CONFLICT,
        Error::InitializationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::AuthenticationFailed { .. } => StatusCode::UNAUTHORIZED,
        Error::InvalidRecipient { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        Error::SendFailed { .. } | Error::MediaFetchFailed { .. } => StatusCode::BAD_GATEWAY,
        Error::EngineStartupFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::PairingRender { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error body for send and status routes: `{error, code}`.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            status_for(&self.0),
            Json(serde_json::json!({
                "error": self.0.to_string(),
                "code": self.0.code(),
            })),
        )
            .into_response()
    }
}

/// Error body for the initialize route: `{status: "error", code, message}`.
pub struct InitError(pub Error);

impl IntoResponse for InitError {
    fn into_response(self) -> Response {
        (
            status_for(&self.0),
            Json(serde_json::json!({
                "status": "error",
                "code": self.0.code(),
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

/// 404 for tenants without a session.
pub fn not_found(tenant_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "error": format!("no session for tenant {tenant_id}"),
            "code": "not_found",
        })),
    )
        .into_response()
}
