use crate::models::association::ObjectState;
use crate::services::state_machine::Event;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Failures surfaced by the orchestrator and its collaborators.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The event is not valid for the state currently persisted. Callers
    /// must inspect the row instead of retrying blindly.
    #[error("cannot apply {event:?} to a template in state {state}")]
    IllegalStateTransition { state: ObjectState, event: Event },
    #[error("remote operation failed: {0}")]
    RemoteOperationFailed(String),
    #[error("endpoint for store {store} unreachable: {reason}")]
    EndpointUnreachable { store: i64, reason: String },
    #[error("account {account} would exceed its secondary storage limit ({requested} > {limit})")]
    ResourceLimitExceeded {
        account: i64,
        requested: i64,
        limit: i64,
    },
    #[error("template {template} has no association with store {store}")]
    AssociationNotFound { store: i64, template: i64 },
    #[error("template `{0}` not found")]
    TemplateNotFound(i64),
    #[error("store `{0}` not found")]
    StoreNotFound(i64),
    #[error("account `{0}` not found")]
    AccountNotFound(i64),
    #[error("operation completed without delivering a result")]
    CompletionDropped,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::StoreNotFound(_)
            | OrchestratorError::TemplateNotFound(_)
            | OrchestratorError::AssociationNotFound { .. } => AppError::not_found(err.to_string()),
            OrchestratorError::IllegalStateTransition { .. } => {
                AppError::new(StatusCode::CONFLICT, err.to_string())
            }
            OrchestratorError::EndpointUnreachable { .. } => {
                AppError::new(StatusCode::BAD_GATEWAY, err.to_string())
            }
            other => AppError::internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
