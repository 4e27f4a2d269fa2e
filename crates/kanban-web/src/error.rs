use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kanban_agents::AgentError;
use kanban_inbox::InboxError;
use kanban_store::StoreError;
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("not found: {resource}")]
    NotFound { resource: String },
    #[error("bad request: {message}")]
    BadRequest { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Inbox(#[from] InboxError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {message}")]
    Internal { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl WebError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebError::NotFound { .. } => StatusCode::NOT_FOUND,
            WebError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            WebError::Conflict { .. } => StatusCode::CONFLICT,
            WebError::Agent(AgentError::MissingSession { .. }) => StatusCode::CONFLICT,
            WebError::Agent(
                AgentError::InvalidRequest { .. } | AgentError::UnsupportedAgent { .. },
            ) => StatusCode::BAD_REQUEST,
            WebError::Agent(_)
            | WebError::Store(_)
            | WebError::Inbox(_)
            | WebError::Io(_)
            | WebError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            WebError::NotFound { .. } => "not_found",
            WebError::BadRequest { .. } => "bad_request",
            WebError::Conflict { .. } => "conflict",
            WebError::Agent(AgentError::MissingSession { .. }) => "missing_session",
            WebError::Agent(AgentError::InvalidRequest { .. }) => "invalid_request",
            WebError::Agent(AgentError::UnsupportedAgent { .. }) => "unsupported_agent",
            WebError::Agent(_) => "agent_error",
            WebError::Store(_) => "store_error",
            WebError::Inbox(_) => "inbox_error",
            WebError::Io(_) => "io_error",
            WebError::Internal { .. } => "internal",
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}
