use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::config::ConfigError;

/// Failures surfaced by the problem service and its stores
#[derive(Error, Debug)]
pub enum ProblemError {
    /// A required field was missing or empty
    #[error("{0}")]
    Validation(String),

    /// The requested object key does not exist
    #[error("Object {0} not found")]
    NotFound(String),

    /// The request body exceeded the configured limit
    #[error("{0}")]
    PayloadTooLarge(String),

    /// A database or object-store call failed
    #[error("Failed to {operation}")]
    Storage {
        operation: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T, E = ProblemError> = std::result::Result<T, E>;

impl ProblemError {
    pub fn storage(operation: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        ProblemError::Storage {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProblemError::Validation(_) => StatusCode::BAD_REQUEST,
            ProblemError::NotFound(_) => StatusCode::NOT_FOUND,
            ProblemError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProblemError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to clients; storage details stay in the logs
    pub fn user_message(&self) -> String {
        match self {
            ProblemError::Validation(message) | ProblemError::PayloadTooLarge(message) => {
                message.clone()
            }
            ProblemError::NotFound(key) => format!("File {key} not found"),
            ProblemError::Storage { operation, .. } => format!("Failed to {operation}"),
        }
    }
}

/// JSON error body returned by every failing endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ProblemError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            // {:#} prints the whole anyhow context chain
            match &self {
                ProblemError::Storage { operation, source } => {
                    error!(operation = %operation, error = %format!("{source:#}"), "Request failed");
                }
                other => error!(error = %other, "Request failed"),
            }
        }

        (
            status,
            Json(ErrorResponse {
                error: self.user_message(),
            }),
        )
            .into_response()
    }
}

/// Fatal errors raised while bringing the process up
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to initialize metrics exporter: {0}")]
    Metrics(String),

    #[error("Failed to initialize record store: {0:#}")]
    RecordStore(anyhow::Error),

    #[error("Failed to initialize object store: {0:#}")]
    ObjectStore(anyhow::Error),

    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("API server error: {0}")]
    Serve(#[source] std::io::Error),
}
