//! HTTP route handlers for the task API.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::{Extension, Router};
use serde::{Deserialize, Serialize};

use orchestrator::core::task::{Task, TaskFilter, TaskStatus};
use orchestrator::service::ServiceError;

use crate::sse;
use crate::state::{AppState, RequestId};

/// Build the API router, mounted under `/api/v1`.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/{id}", get(get_task).patch(update_task))
        .route("/tasks/{id}/logs", get(sse::task_logs))
}

async fn health() -> &'static str {
    "ok"
}

/// Error JSON shape shared by all endpoints.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn from_service(err: ServiceError, request_id: &RequestId) -> Self {
        let (status, code) = match &err {
            ServiceError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ServiceError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ServiceError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ServiceError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        // Internal details stay opaque to clients.
        let message = match &err {
            ServiceError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        Self {
            status,
            body: ErrorBody {
                error: code,
                message,
                request_id: Some(request_id.0.clone()),
            },
        }
    }

    pub fn validation(message: impl Into<String>, request_id: &RequestId) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                error: "validation_error",
                message: message.into(),
                request_id: Some(request_id.0.clone()),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    repo: String,
    prompt: String,
}

#[derive(Debug, Serialize)]
struct CreateTaskResponse {
    id: String,
    branch: String,
}

/// POST /api/v1/tasks
async fn create_task(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), ApiError> {
    let task = state
        .service
        .create_task(&req.repo, &req.prompt)
        .await
        .map_err(|err| ApiError::from_service(err, &request_id))?;
    Ok((
        StatusCode::CREATED,
        Json(CreateTaskResponse {
            id: task.id,
            branch: task.branch,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    status: Option<String>,
    repo: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Serialize)]
struct TaskListResponse {
    tasks: Vec<Task>,
    total: i64,
}

/// GET /api/v1/tasks
async fn list_tasks(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Query(query): Query<ListQuery>,
) -> Result<Json<TaskListResponse>, ApiError> {
    let status = match &query.status {
        Some(raw) => Some(
            TaskStatus::parse(raw)
                .ok_or_else(|| ApiError::validation(format!("invalid status: {raw}"), &request_id))?,
        ),
        None => None,
    };
    let filter = TaskFilter {
        status,
        repo: query.repo,
        limit: query.limit,
        offset: query.offset,
    };
    let (tasks, total) = state
        .service
        .list_tasks(filter)
        .await
        .map_err(|err| ApiError::from_service(err, &request_id))?;
    Ok(Json(TaskListResponse { tasks, total }))
}

/// GET /api/v1/tasks/{id}
async fn get_task(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let task = state
        .service
        .get_task(&id)
        .await
        .map_err(|err| ApiError::from_service(err, &request_id))?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct UpdateTaskRequest {
    action: String,
    prompt: Option<String>,
}

/// PATCH /api/v1/tasks/{id} with `{action: "continue" | "abort"}`.
async fn update_task(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<StatusCode, ApiError> {
    match req.action.as_str() {
        "continue" => state
            .service
            .continue_task(&id, req.prompt.as_deref())
            .await
            .map_err(|err| ApiError::from_service(err, &request_id))?,
        "abort" => state
            .service
            .abort_task(&id)
            .await
            .map_err(|err| ApiError::from_service(err, &request_id))?,
        other => {
            return Err(ApiError::validation(
                format!("invalid action: {other}"),
                &request_id,
            ))
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_id() -> RequestId {
        RequestId("req-1".to_string())
    }

    #[test]
    fn service_errors_map_to_status_codes() {
        let cases = [
            (ServiceError::NotFound, StatusCode::NOT_FOUND, "not_found"),
            (
                ServiceError::Conflict("x".to_string()),
                StatusCode::CONFLICT,
                "conflict",
            ),
            (
                ServiceError::Validation("x".to_string()),
                StatusCode::BAD_REQUEST,
                "validation_error",
            ),
            (
                ServiceError::Internal("x".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
            ),
        ];
        for (err, status, code) in cases {
            let api = ApiError::from_service(err, &request_id());
            assert_eq!(api.status, status);
            assert_eq!(api.body.error, code);
            assert_eq!(api.body.request_id.as_deref(), Some("req-1"));
        }
    }

    #[test]
    fn internal_errors_are_opaque() {
        let api = ApiError::from_service(
            ServiceError::Internal("db exploded at /secret/path".to_string()),
            &request_id(),
        );
        assert_eq!(api.body.message, "internal error");
    }

    #[test]
    fn error_body_serializes_expected_shape() {
        let body = ErrorBody {
            error: "conflict",
            message: "cannot transition".to_string(),
            request_id: Some("req-1".to_string()),
        };
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json["error"], "conflict");
        assert_eq!(json["message"], "cannot transition");
        assert_eq!(json["request_id"], "req-1");
    }
}
