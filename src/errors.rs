use std::time::Duration;

use axum::{
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;
use tracing::error;

use crate::{models::response::ApiResponse, producer::ProducerError};

/// Failures surfaced to HTTP callers by the admission chain and handlers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("{0}")]
    AccessDenied(String),

    #[error("Too many requests, please try again later")]
    RateLimited { retry_after: Duration },

    #[error("{0}")]
    InvalidInput(String),

    #[error("Identity store unavailable: {0}")]
    IdentityStoreUnavailable(String),

    #[error("Message broker unavailable: {0}")]
    Broker(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized | AppError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AppError::AccessDenied(_) => StatusCode::FORBIDDEN,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::IdentityStoreUnavailable(_) | AppError::Broker(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "unauthorized",
            AppError::InvalidCredentials => "invalid_credentials",
            AppError::AccessDenied(_) => "access_denied",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::IdentityStoreUnavailable(_) => "identity_store_unavailable",
            AppError::Broker(_) => "broker_unavailable",
            AppError::Internal(_) => "internal_error",
        }
    }

    fn public_message(&self) -> String {
        match self {
            AppError::IdentityStoreUnavailable(_) | AppError::Broker(_) => {
                "Service temporarily unavailable".to_string()
            }
            AppError::Internal(_) => "Something went wrong".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            error!(error = %self, code = self.code(), "Request failed");
        }

        let body = ApiResponse::failure(self.code(), self.public_message());
        let mut response = (status, Json(body)).into_response();

        if let AppError::RateLimited { retry_after } = &self {
            let seconds = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }

        response
    }
}

impl From<ProducerError> for AppError {
    fn from(error: ProducerError) -> Self {
        match error {
            ProducerError::Serialize(e) => AppError::Internal(e.to_string()),
            other => AppError::Broker(other.to_string()),
        }
    }
}
