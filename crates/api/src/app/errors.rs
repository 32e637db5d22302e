use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use finsync_core::DomainError;
use finsync_infra::jobs::RepositoryError;
use finsync_infra::sync::SyncError;

pub fn sync_error_to_response(err: SyncError) -> axum::response::Response {
    match err {
        SyncError::Domain(DomainError::Validation(msg)) | SyncError::Domain(DomainError::InvalidId(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        SyncError::Repository(RepositoryError::NotFound(_))
        | SyncError::Repository(RepositoryError::UserIsolation) => not_found(),
        SyncError::Repository(RepositoryError::ActiveJobExists(job_id)) => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "error": "sync_in_progress",
                "message": "a sync is already in progress",
                "jobId": job_id,
            })),
        )
            .into_response(),
        SyncError::Provider(e) => json_error(StatusCode::BAD_GATEWAY, "provider_error", e.summary()),
        other => {
            error!(error = %other, "request failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal error",
            )
        }
    }
}

pub fn not_found() -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", "sync job not found")
}

pub fn validation_error(message: impl Into<String>) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", message)
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
