use crate::orchestrator::data::DataError;
use crate::orchestrator::EngineError;
use crate::presets::PresetError;
use crate::runner::RunnerError;
use crate::storage::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        } else {
            tracing::warn!("{}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<DataError> for ApiError {
    fn from(e: DataError) -> Self {
        match e {
            DataError::Io { .. } => ApiError::Internal(e.to_string()),
            _ => ApiError::BadRequest(format!("Invalid CSV: {}", e)),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::InvalidParameters(_) => ApiError::BadRequest(e.to_string()),
            EngineError::Cancelled => ApiError::BadRequest(e.to_string()),
            EngineError::Overflow(_) => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<RunnerError> for ApiError {
    fn from(e: RunnerError) -> Self {
        match e {
            RunnerError::InvalidInput(msg) => ApiError::BadRequest(msg),
            RunnerError::TooLarge(_) => ApiError::BadRequest(e.to_string()),
            RunnerError::Data(e) => e.into(),
            RunnerError::Engine(e) => e.into(),
            RunnerError::Upstream(_) | RunnerError::Http(_) => ApiError::Upstream(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<PresetError> for ApiError {
    fn from(e: PresetError) -> Self {
        match e {
            PresetError::InvalidName(_) | PresetError::Yaml(_) => ApiError::BadRequest(e.to_string()),
            PresetError::NotFound(_) => ApiError::NotFound(e.to_string()),
            PresetError::Io(_) => ApiError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = ApiError::NotFound("Backtest not found".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, serde_json::json!({ "error": "Backtest not found" }));
    }

    #[test]
    fn test_engine_errors_are_client_errors() {
        let err: ApiError = EngineError::InvalidParameters("tick_size must be positive".into()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
