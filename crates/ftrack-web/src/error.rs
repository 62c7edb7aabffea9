use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ftrack_import::ImportError;
use ftrack_ledger::LedgerError;
use ftrack_report::ExportError;
use ftrack_storage::StorageError;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::attachments::AttachmentError;

/// Every failure a handler can return, rendered as `{"error": {"code", "message"}}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Attachments(#[from] AttachmentError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) | ApiError::Storage(StorageError::NotFound { .. }) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Ledger(err) => match err {
                LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
                LedgerError::Forbidden(_) => StatusCode::FORBIDDEN,
                LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
                LedgerError::InvalidTransition(_) | LedgerError::NotConfirmed { .. } => {
                    StatusCode::CONFLICT
                }
                LedgerError::Storage(_) => StatusCode::BAD_GATEWAY,
                LedgerError::PartialMove(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Storage(_) | ApiError::Attachments(AttachmentError::Fetch { .. }) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Import(ImportError::Template(_))
            | ApiError::Export(_)
            | ApiError::Attachments(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Import(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) | ApiError::Storage(StorageError::NotFound { .. }) => "not_found",
            ApiError::Ledger(err) => err.code(),
            ApiError::Storage(_) => "storage",
            ApiError::Import(ImportError::Template(_)) => "template",
            ApiError::Import(_) => "import",
            ApiError::Export(_) => "export",
            ApiError::Attachments(AttachmentError::Fetch { .. }) => "attachment_fetch",
            ApiError::Attachments(_) => "attachments",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();
        if status.is_server_error() {
            error!(code, error = %message, "request failed");
        } else {
            warn!(code, error = %message, "request rejected");
        }
        (status, Json(json!({ "error": { "code": code, "message": message } }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_errors_keep_their_message_and_status() {
        let err: ApiError = LedgerError::NotFound { what: "faculty_events", id: 9 }.into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.to_string(), LedgerError::NotFound { what: "faculty_events", id: 9 }.to_string());

        let err: ApiError = StorageError::Backend("connection reset".into()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.code(), "storage");
        assert_eq!(err.to_string(), "connection reset");

        let err: ApiError = StorageError::NotFound { table: "flagged_events", id: 4 }.into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn plain_variants_render_their_text() {
        let err = ApiError::Unauthorized("missing x-ftrack-actor header".into());
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.to_string(), "missing x-ftrack-actor header");
        assert_eq!(ApiError::NotFound("no attachments".into()).code(), "not_found");
    }
}
