use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Repository not found: {0}")]
    RepoNotFound(String),

    #[error("Repository already exists: {0}")]
    RepoAlreadyExists(String),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Malformed ref {name}: {reason}")]
    MalformedRef { name: String, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] DbErr),

    /// Two writers inserted the same (repo, branch) row at once. Only seen
    /// inside the branch store, which turns it into an update.
    #[error("Branch {0} was created concurrently")]
    UniquenessRace(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn malformed_ref(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ServerError::MalformedRef {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// True when the database rejected an insert because of a unique index.
pub fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::RepoNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::RepoAlreadyExists(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::BranchNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::MalformedRef { .. } => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::UniquenessRace(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::Persistence(e) => {
                tracing::error!("persistence failure: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            ServerError::Internal(_) | ServerError::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
