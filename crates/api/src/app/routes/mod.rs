use axum::{
    routing::{get, post},
    Router,
};

pub mod sync;
pub mod system;

/// Router for all authenticated (user-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/sync", post(sync::start_sync))
        .route("/sync/jobs", get(sync::list_jobs))
        .route("/sync/:job_id", get(sync::get_job))
        .route("/reprocess", post(sync::start_reprocess))
        .route("/preview", post(sync::preview))
}
