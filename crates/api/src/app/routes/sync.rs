//! Sync job endpoints.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use finsync_infra::sync::{SyncRequest, PREVIEW_LIMIT};

use crate::app::{dto, errors, services::AppServices};
use crate::context::UserContext;

/// POST /sync
///
/// Create a sync job and run it in the background. Returns `202 { jobId }`.
pub async fn start_sync(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    body: Bytes,
) -> axum::response::Response {
    let body: dto::StartSyncRequest = match dto::parse_body(&body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let category = match dto::parse_category(body.category) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let request = SyncRequest {
        query: body.query,
        cursor: body.cursor,
        category,
    };
    let job = match services.sync.start_sync(user.user_id(), request).await {
        Ok(job) => job,
        Err(e) => return errors::sync_error_to_response(e),
    };

    let job_id = job.id;
    services.runner.spawn(job).await;

    (StatusCode::ACCEPTED, Json(dto::JobAccepted { job_id })).into_response()
}

/// POST /reprocess
pub async fn start_reprocess(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    body: Bytes,
) -> axum::response::Response {
    let body: dto::ReprocessRequest = match dto::parse_body(&body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let category = match dto::parse_category(body.category) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let job = match services.sync.start_reprocess(user.user_id(), category).await {
        Ok(job) => job,
        Err(e) => return errors::sync_error_to_response(e),
    };

    let job_id = job.id;
    services.runner.spawn(job).await;

    (StatusCode::ACCEPTED, Json(dto::JobAccepted { job_id })).into_response()
}

/// GET /sync/:job_id
///
/// Jobs owned by other users are reported as missing.
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.sync.get_job(user.user_id(), job_id).await {
        Ok(Some(job)) => Json(dto::SyncJobView::from(job)).into_response(),
        Ok(None) => errors::not_found(),
        Err(e) => errors::sync_error_to_response(e),
    }
}

/// GET /sync/jobs?limit=
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    match services.sync.list_jobs(user.user_id(), query.limit()).await {
        Ok(jobs) => Json(dto::JobList {
            jobs: jobs.into_iter().map(dto::SyncJobView::from).collect(),
        })
        .into_response(),
        Err(e) => errors::sync_error_to_response(e),
    }
}

/// POST /preview
///
/// Fetch a few matching emails without creating a job or storing anything.
pub async fn preview(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    body: Bytes,
) -> axum::response::Response {
    let body: dto::PreviewRequest = match dto::parse_body(&body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let category = match dto::parse_category(body.category) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let result = services
        .sync
        .fetch_preview_emails(
            user.user_id(),
            body.query.as_deref(),
            body.max_results.unwrap_or(PREVIEW_LIMIT),
            category,
        )
        .await;

    match result {
        Ok(emails) => Json(dto::PreviewResponse { emails }).into_response(),
        Err(e) => errors::sync_error_to_response(e),
    }
}
