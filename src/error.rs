use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Panel unavailable: {0}")]
    PanelUnavailable(String),
    #[error("Invalid token")]
    InvalidToken,
    #[error("Variable '{name}' violates rules '{rules}'")]
    VariableRuleViolation { name: String, rules: String },
    #[error("Unknown cargo reference: {0}")]
    UnknownCargo(String),
    #[error("Image pull failed for '{image}': {reason}")]
    ImagePullFailed { image: String, reason: String },
    #[error("Container operation failed: {0}")]
    ContainerOpFailed(String),
    #[error("Install script failed with exit code {0}")]
    InstallScriptFailed(i64),
    #[error("Server not found: {0}")]
    RecordNotFound(String),
    #[error("Invalid power transition: cannot {action} while {state}")]
    InvalidTransition { action: String, state: String },
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("Authentication timed out")]
    AuthTimeout,
    #[error("Database error: {0}")]
    Database(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::RecordNotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidTransition { .. }
            | AppError::VariableRuleViolation { .. }
            | AppError::UnknownCargo(_)
            | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidToken | AppError::AuthTimeout => StatusCode::UNAUTHORIZED,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<sea_orm::DbErr> for AppError {
    fn from(err: sea_orm::DbErr) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON serialization error: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(format!("I/O error: {err}"))
    }
}

impl From<bollard::errors::Error> for AppError {
    fn from(err: bollard::errors::Error) -> Self {
        AppError::ContainerOpFailed(err.to_string())
    }
}
