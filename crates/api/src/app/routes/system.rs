use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let stats = super::blocking(&services, |s| {
        let jobs = s.ledger.stats()?;
        let cache = s.cache.stats()?;
        Ok::<_, anyhow::Error>(dto::StatsResponse { jobs, cache })
    })
    .await;

    match stats {
        Ok(Ok(body)) => (StatusCode::OK, Json(body)).into_response(),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "stats read failed");
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string())
        }
        Err(response) => response,
    }
}
