use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use bulklabel_infra::dispatcher::DispatchError;
use bulklabel_infra::status::ResultError;

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    match err {
        DispatchError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DispatchError::QuotaExceeded(msg) => {
            json_error(StatusCode::TOO_MANY_REQUESTS, "quota_exceeded", msg)
        }
        e @ DispatchError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", e.to_string()),
        e @ DispatchError::Forbidden(_) => json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string()),
        e @ DispatchError::AlreadyTerminal { .. } => {
            json_error(StatusCode::CONFLICT, "already_terminal", e.to_string())
        }
        e @ (DispatchError::Ledger(_) | DispatchError::Cache(_)) => {
            tracing::error!(error = %e, "dispatch failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string())
        }
    }
}

pub fn result_error_to_response(err: ResultError) -> axum::response::Response {
    match err {
        e @ ResultError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", e.to_string()),
        ResultError::Failed { error, .. } => {
            json_error(StatusCode::CONFLICT, "job_failed", error.to_string())
        }
        e @ ResultError::Cancelled(_) => json_error(StatusCode::CONFLICT, "job_cancelled", e.to_string()),
        e @ ResultError::ResultMissing(_) => {
            tracing::error!(error = %e, "completed job without result");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "result_missing", e.to_string())
        }
        e @ ResultError::Ledger(_) => {
            tracing::error!(error = %e, "status read failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string())
        }
    }
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
