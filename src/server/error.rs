use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Body of every error response
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorEnvelope {
    pub code: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields_detail: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl<E: Into<EngineError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(code = err.code(), "request failed: {}", err);
        } else {
            tracing::debug!(code = err.code(), "request rejected: {}", err);
        }
        let body = ErrorEnvelope {
            code: err.code().to_string(),
            detail: err.to_string(),
            fields_detail: err.fields_detail().cloned(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_validation_envelope() {
        let response = ApiError(EngineError::field("replicas", "must not be negative")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.code, "VALIDATION_ERROR");
        assert_eq!(
            body.fields_detail.unwrap()["replicas"],
            vec!["must not be negative".to_string()]
        );
    }

    #[test]
    fn test_conflict_status() {
        let response = ApiError(EngineError::conflict("DEPLOYMENT_IN_PROGRESS", "busy")).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
