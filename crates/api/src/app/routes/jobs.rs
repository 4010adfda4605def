use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use bulklabel_core::{JobId, OwnerRef};
use bulklabel_infra::dispatcher::{SubmitRequest, Submission};
use bulklabel_infra::status::{JobStatusView, ResultLookup};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Header identifying the caller on cancellation.
pub const OWNER_HEADER: &str = "x-owner-ref";

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job))
        .route("/:id", get(get_job).delete(cancel_job))
        .route("/:id/result", get(get_job_result))
}

fn parse_job_id(id: &str) -> Result<JobId, axum::response::Response> {
    id.parse::<JobId>().map_err(|e| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_job_id", e.to_string())
    })
}

pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::SubmitJobRequest>,
) -> axum::response::Response {
    let request = SubmitRequest::from(body);
    let outcome = match super::blocking(&services, move |s| s.dispatcher.submit(request)).await {
        Ok(outcome) => outcome,
        Err(response) => return response,
    };

    match outcome {
        Ok(submission) => {
            let status = match submission {
                Submission::Cached { .. } => StatusCode::OK,
                Submission::Queued { .. } | Submission::InFlight { .. } => StatusCode::ACCEPTED,
            };
            (status, Json(dto::SubmitJobResponse::from(submission))).into_response()
        }
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match super::blocking(&services, move |s| s.status.get_status(job_id)).await {
        Ok(Ok(view)) => (StatusCode::OK, Json(view)).into_response(),
        Ok(Err(e)) => errors::result_error_to_response(e),
        Err(response) => response,
    }
}

pub async fn get_job_result(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match super::blocking(&services, move |s| s.status.get_result(job_id)).await {
        Ok(Ok(ResultLookup::Ready {
            job_id,
            result_ref,
            result,
        })) => (
            StatusCode::OK,
            Json(dto::JobResultResponse {
                job_id,
                result_ref,
                result,
            }),
        )
            .into_response(),
        Ok(Ok(ResultLookup::NotReady(view))) => {
            (StatusCode::ACCEPTED, Json(dto::NotReadyResponse::from(view))).into_response()
        }
        Ok(Err(e)) => errors::result_error_to_response(e),
        Err(response) => response,
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let owner = match headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        Some(owner) => OwnerRef::new(owner),
        None => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "missing_owner",
                format!("{OWNER_HEADER} header is required"),
            );
        }
    };

    match super::blocking(&services, move |s| s.dispatcher.cancel(job_id, &owner)).await {
        Ok(Ok(job)) => (StatusCode::OK, Json(JobStatusView::from(&job))).into_response(),
        Ok(Err(e)) => errors::dispatch_error_to_response(e),
        Err(response) => response,
    }
}
