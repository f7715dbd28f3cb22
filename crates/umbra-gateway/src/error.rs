//! API error envelope
//!
//! Every uncaught error maps to the stable envelope
//! `{success:false, error, message, details?}`. Internal errors are logged
//! with a correlation id and returned without sensitive detail.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use umbra_core::UmbraError;
use uuid::Uuid;

/// Wrapper giving `UmbraError` an HTTP rendering
pub struct ApiError(pub UmbraError);

impl From<UmbraError> for ApiError {
    fn from(err: UmbraError) -> Self {
        Self(err)
    }
}

/// Status code per taxonomy tag
fn status_for(err: &UmbraError) -> StatusCode {
    match err {
        UmbraError::AuthRequired | UmbraError::TokenInvalid { .. } => StatusCode::UNAUTHORIZED,
        UmbraError::OrgMismatch | UmbraError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        UmbraError::NotFound { .. } => StatusCode::NOT_FOUND,
        UmbraError::ValidationFailed { .. } => StatusCode::BAD_REQUEST,
        // An expired grant surfaces as a connection-state conflict so the
        // dashboard shows the re-auth prompt
        UmbraError::Conflict { .. } | UmbraError::InvalidGrant { .. } => StatusCode::CONFLICT,
        UmbraError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        UmbraError::UpstreamRateLimited { .. } | UmbraError::UpstreamUnavailable { .. } => {
            StatusCode::BAD_GATEWAY
        }
        UmbraError::KeyUnavailable { .. }
        | UmbraError::DecryptionFailure { .. }
        | UmbraError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let kind = self.0.kind();

        let (message, details) = match &self.0 {
            UmbraError::Internal { reason } => {
                // Sensitive detail stays in the logs, keyed by correlation id
                let correlation_id = Uuid::new_v4();
                tracing::error!(%correlation_id, %reason, "internal error");
                (
                    "internal error".to_string(),
                    Some(json!({"correlationId": correlation_id})),
                )
            }
            UmbraError::ValidationFailed { field, reason } => (
                self.0.to_string(),
                Some(json!({"field": field, "reason": reason})),
            ),
            UmbraError::RateLimited { retry_after_secs }
            | UmbraError::UpstreamRateLimited { retry_after_secs } => (
                self.0.to_string(),
                Some(json!({"retryAfterSecs": retry_after_secs})),
            ),
            other => (other.to_string(), None),
        };

        let mut body = json!({
            "success": false,
            "error": kind,
            "message": message,
        });
        if let Some(details) = details {
            body["details"] = details;
        }

        let mut response = (status, Json(body)).into_response();
        if let UmbraError::RateLimited { retry_after_secs }
        | UmbraError::UpstreamRateLimited { retry_after_secs } = &self.0
        {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}
