use axum::http::StatusCode;
use thiserror::Error;

use crate::crypto::CryptoError;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("connection {0} not found")]
    ConnectionNotFound(i64),

    #[error("chat session {0} not found")]
    SessionNotFound(i64),

    #[error("unsupported engine kind: {0}")]
    UnsupportedEngineKind(String),

    #[error("credential error: {0}")]
    Credential(#[from] CryptoError),

    #[error("introspection failed: {0}")]
    IntrospectionFailure(String),

    #[error("translation failed: {0}")]
    TranslationFailure(String),

    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    #[error("persistence failed: {0}")]
    PersistenceFailure(String),

    #[error("scan queue is unavailable")]
    QueueUnavailable,
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::UnsupportedEngineKind(_) => "UNSUPPORTED_ENGINE_KIND",
            Self::Credential(_) => "CREDENTIAL_FAILURE",
            Self::IntrospectionFailure(_) => "INTROSPECTION_FAILURE",
            Self::TranslationFailure(_) => "TRANSLATION_FAILURE",
            Self::ExecutionFailure(_) => "EXECUTION_FAILURE",
            Self::PersistenceFailure(_) => "PERSISTENCE_FAILURE",
            Self::QueueUnavailable => "QUEUE_UNAVAILABLE",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::ConnectionNotFound(_) | Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::UnsupportedEngineKind(_) => StatusCode::BAD_REQUEST,
            Self::QueueUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::IntrospectionFailure(_)
            | Self::TranslationFailure(_)
            | Self::ExecutionFailure(_) => StatusCode::BAD_GATEWAY,
            Self::Credential(_) | Self::PersistenceFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::PersistenceFailure(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::PersistenceFailure(format!("metadata document: {err}"))
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::PersistenceFailure(format!("store task aborted: {err}"))
    }
}
