use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use smsdesk::protocol::ErrorBody;
use smsdesk_store::StoreError;
use thiserror::Error;

use crate::carrier::CarrierError;

/// Failure of a REST or webhook request, rendered as `{error, code}`.
#[derive(Error, Debug)]
pub enum ApiFailure {
    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Carrier(#[from] CarrierError),

    #[error("{0}")]
    Internal(String),
}

impl ApiFailure {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiFailure::Invalid(_) => StatusCode::BAD_REQUEST,
            ApiFailure::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiFailure::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiFailure::NotFound(_) => StatusCode::NOT_FOUND,
            ApiFailure::Conflict(_) => StatusCode::CONFLICT,
            ApiFailure::Carrier(_) => StatusCode::BAD_GATEWAY,
            ApiFailure::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiFailure::Invalid(_) => "invalid",
            ApiFailure::Unauthorized(_) => "unauthorized",
            ApiFailure::Forbidden(_) => "forbidden",
            ApiFailure::NotFound(_) => "not_found",
            ApiFailure::Conflict(_) => "conflict",
            ApiFailure::Carrier(_) => "carrier",
            ApiFailure::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for ApiFailure {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiFailure::NotFound(format!("{what} not found")),
            StoreError::Conflict(msg) => ApiFailure::Conflict(msg),
            StoreError::Invalid(msg) => ApiFailure::Invalid(msg),
            other => ApiFailure::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "{self}");
        } else {
            tracing::debug!(code = self.code(), "{self}");
        }
        let body = ErrorBody {
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}
