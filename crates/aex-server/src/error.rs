use aex_contracts::ErrorBody;
use aex_store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use thiserror::Error;

/// Handler-level error taxonomy. Every variant maps to exactly one status
/// code and a uniform `{"detail": ...}` body, except upstream passthrough
/// which relays the provider's own error body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing bearer token")]
    AuthMissing,
    #[error("invalid API token")]
    AuthInvalid,
    #[error("API token has expired")]
    AuthExpired,
    #[error("insufficient budget")]
    Budget { body: Value },
    #[error("policy violation: {0}")]
    PolicyDenied(String),
    #[error("rate limit exceeded: {0}")]
    RateExceeded(String),
    #[error("idempotency conflict")]
    IdempotencyConflict,
    #[error("execution already in progress")]
    InFlight,
    #[error("agent lifecycle is {0}; execution blocked")]
    AgentBlocked(String),
    #[error("upstream returned {status}")]
    Upstream { status: u16, body: Value },
    #[error("upstream provider timed out")]
    UpstreamTimeout,
    #[error("store unavailable")]
    StoreUnavailable,
    #[error("admissions locked pending audit")]
    IntegrityLocked,
    #[error("admin key missing or invalid")]
    AdminUnauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::AuthMissing | ApiError::AuthInvalid | ApiError::AuthExpired => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::Budget { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::PolicyDenied(_) => StatusCode::FORBIDDEN,
            ApiError::RateExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::IdempotencyConflict | ApiError::InFlight => StatusCode::CONFLICT,
            ApiError::AgentBlocked(_) => StatusCode::LOCKED,
            ApiError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::StoreUnavailable | ApiError::IntegrityLocked => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::AdminUnauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::Budget { body } | ApiError::Upstream { body, .. } => {
                (status, Json(body)).into_response()
            }
            other => {
                let detail = other.to_string();
                (status, Json(ErrorBody::new(detail))).into_response()
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict => ApiError::StoreUnavailable,
            StoreError::AgentBlocked { state } => ApiError::AgentBlocked(state),
            StoreError::NotFound { what: "agent", .. } => ApiError::AuthInvalid,
            other => ApiError::Internal(other.to_string()),
        }
    }
}
