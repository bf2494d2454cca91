//! HTTP error responses.

use axum::{http::StatusCode, response::IntoResponse, Json};
use parley_core::BrokerError;
use parley_service::ServiceError;
use parley_store::StoreError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::metrics;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(json!({ "code": self.code, "message": self.message }));
        (self.status, body).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match &err {
            ServiceError::NotAllowed => Self::forbidden(err.to_string()),
            ServiceError::InvalidFormFactor(_) | ServiceError::InvalidCursorMode(_) => {
                Self::bad_request(err.to_string())
            }
            ServiceError::Store(StoreError::NotFound) => Self::not_found(err.to_string()),
            ServiceError::Broker(
                BrokerError::InvalidChannel(_)
                | BrokerError::MaxSubscriptionsReached
                | BrokerError::TooManyChannels,
            ) => Self::bad_request(err.to_string()),
            _ => {
                error!(error = %err, "request failed");
                metrics::record_error("service");
                Self::internal_server_error("internal error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::InvalidCursorMode;

    #[test]
    fn test_service_error_status() {
        let cases = [
            (ServiceError::NotAllowed, StatusCode::FORBIDDEN),
            (
                ServiceError::InvalidCursorMode(InvalidCursorMode("sideways".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ServiceError::Store(StoreError::NotFound),
                StatusCode::NOT_FOUND,
            ),
            (
                ServiceError::Broker(BrokerError::TooManyChannels),
                StatusCode::BAD_REQUEST,
            ),
            (
                ServiceError::Store(StoreError::Poisoned),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ServiceError::InvalidConfig("default_expiry_secs".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[tokio::test]
    async fn test_into_response_body() {
        let response = ApiError::forbidden("nope").into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "forbidden");
        assert_eq!(body["message"], "nope");
    }
}
