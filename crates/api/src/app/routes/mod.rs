use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use crate::app::errors;
use crate::app::services::AppServices;

pub mod jobs;
pub mod system;

/// Router for the job endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/stats", get(system::stats))
        .nest("/jobs", jobs::router())
}

/// Run a synchronous service call off the async executor.
pub(crate) async fn blocking<T, F>(
    services: &Arc<AppServices>,
    f: F,
) -> Result<T, axum::response::Response>
where
    F: FnOnce(&AppServices) -> T + Send + 'static,
    T: Send + 'static,
{
    let services = services.clone();
    tokio::task::spawn_blocking(move || f(&services))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "blocking task failed");
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
        })
}
