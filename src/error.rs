use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

use crate::types::ErrorResponse;

/// Failures of the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("endpoint not found: {0}")]
    NotFound(String),

    #[error("endpoint id already taken: {0}")]
    Conflict(String),
}

/// Errors surfaced at the HTTP boundary.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Storage(StoreError),
}

impl From<StoreError> for HubError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => HubError::NotFound(format!("Endpoint not found: {id}")),
            other => HubError::Storage(other),
        }
    }
}

impl HubError {
    pub fn status(&self) -> StatusCode {
        match self {
            HubError::Validation(_) => StatusCode::BAD_REQUEST,
            HubError::NotFound(_) => StatusCode::NOT_FOUND,
            HubError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            HubError::Storage(e) => {
                error!("storage error: {e}");
                "internal storage error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
