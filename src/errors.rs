use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::path::PathBuf;
use utoipa::ToSchema;

use crate::models::SourceKind;
use crate::services::overrides::OverrideError;

/// Standard error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    /// A source could not be fetched and no cached entry can stand in for it.
    #[error("Source '{kind}' unavailable: {reason}")]
    SourceUnavailable { kind: SourceKind, reason: String },

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl AppError {
    pub fn source_unavailable(kind: SourceKind, reason: impl Into<String>) -> Self {
        AppError::SourceUnavailable {
            kind,
            reason: reason.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotReady(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::SourceUnavailable { .. } => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal error".to_string(),
                )
            }
        };

        (status, axum::Json(ErrorResponse { error: message })).into_response()
    }
}

/// Errors from reading or writing the on-disk source cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("timed out waiting for cache lease {}", .0.display())]
    LeaseTimeout(PathBuf),
}

/// Recoverable problems recorded during a run instead of aborting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A source row could not be parsed and was skipped.
    MalformedRow,
    /// A row's airport identifier could not be joined to a canonical airport.
    IdentifierAliasing,
    /// A persisted cache entry was unreadable and was discarded.
    CacheCorruption,
}

/// A per-row or per-entry problem that degraded, but did not stop, a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Source the problem came from; `None` for the override sheet.
    pub source: Option<SourceKind>,
    pub message: String,
}

impl Diagnostic {
    pub fn malformed_row(source: Option<SourceKind>, message: impl Into<String>) -> Self {
        Self::logged(DiagnosticKind::MalformedRow, source, message.into())
    }

    pub fn aliasing(source: Option<SourceKind>, message: impl Into<String>) -> Self {
        Self::logged(DiagnosticKind::IdentifierAliasing, source, message.into())
    }

    pub fn cache_corruption(source: SourceKind, message: impl Into<String>) -> Self {
        Self::logged(DiagnosticKind::CacheCorruption, Some(source), message.into())
    }

    fn logged(kind: DiagnosticKind, source: Option<SourceKind>, message: String) -> Self {
        tracing::warn!(
            "[{}] {:?}: {}",
            source.map(|s| s.name()).unwrap_or("overrides"),
            kind,
            message
        );
        Self {
            kind,
            source,
            message,
        }
    }
}

/// Failures that abort a whole run. Nothing is published when one occurs.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("every source is unavailable: {}", .0.join("; "))]
    AllSourcesUnavailable(Vec<String>),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Overrides(#[from] OverrideError),
}
