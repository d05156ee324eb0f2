//! Task submission and lookup routes.

use std::str::FromStr;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::TaskError;
use crate::scheduler::{QueueClass, ResultRecord, ResultStatus, Task, TaskLookup};

use super::{ApiError, AppState};

/// Default number of records returned by `GET /results/:class`.
pub const DEFAULT_RESULTS_LIMIT: usize = 20;

/// Upper bound on `limit` for `GET /results/:class`.
pub const MAX_RESULTS_LIMIT: usize = 100;

/// Longest client-supplied `taskId` accepted.
pub const MAX_TASK_ID_LEN: usize = 128;

/// Whether a client-supplied id is safe to use as a key and a path segment.
fn is_valid_task_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_TASK_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}

/// Body of `POST /task`.
///
/// `output` is the expected output attached by the caller; it is stored with
/// the task and never compared by the worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub question_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Accepts ids sent as strings or numbers.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

impl SubmitRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_action(mut self, class: QueueClass) -> Self {
        self.action = Some(class.as_str().to_string());
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Validates the submission and builds the task to enqueue.
    ///
    /// A missing `action` means `run`. A non-empty `taskId` is kept if it
    /// passes the id charset check, otherwise a UUID v4 is assigned.
    pub fn into_task(self) -> Result<Task, TaskError> {
        let class = match self.action.as_deref() {
            None | Some("") => QueueClass::Run,
            Some(action) => QueueClass::from_str(action)?,
        };

        if self.code.is_empty() {
            return Err(TaskError::MissingField("code"));
        }
        if self.language.trim().is_empty() {
            return Err(TaskError::MissingField("language"));
        }

        let task_id = match self.task_id.filter(|id| !id.is_empty()) {
            Some(id) if is_valid_task_id(&id) => id,
            Some(id) => return Err(TaskError::InvalidTaskId(id)),
            None => Uuid::new_v4().to_string(),
        };

        Ok(Task {
            task_id,
            language: self.language.trim().into(),
            code: self.code,
            stdin: self.stdin,
            version: self.version.filter(|v| !v.is_empty()),
            queue_class: class,
            question_id: self.question_id,
            user_id: self.user_id,
            expected_output: self.output,
        })
    }
}

/// Body of the 202 answer to `POST /task`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub task_id: String,
    pub queue_class: QueueClass,
}

/// Body of `GET /task/:id` while the task has no result yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingResponse {
    pub task_id: String,
    pub status: ResultStatus,
}

/// POST /task - Validate and enqueue a submission
pub async fn submit_task(
    State(state): State<AppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let task = request.into_task().map_err(|e| {
        tracing::debug!(error = %e, "Rejected submission");
        state.metrics.record_submission("unknown", "rejected");
        ApiError::BadRequest(e.to_string())
    })?;
    let class = task.queue_class;

    // Marker first, so a poll that races the worker never sees 404.
    state.store.mark_pending(&task.task_id).await.map_err(|e| {
        tracing::error!(task_id = %task.task_id, error = %e, "Failed to mark task pending");
        state.metrics.record_submission(class.as_str(), "unavailable");
        ApiError::Unavailable("Result store unavailable".to_string())
    })?;

    if let Err(e) = state.queue.enqueue(class, &task).await {
        tracing::error!(task_id = %task.task_id, queue = %class, error = %e, "Failed to enqueue task");
        if let Err(e) = state.store.clear_pending(&task.task_id).await {
            tracing::warn!(task_id = %task.task_id, error = %e, "Failed to clear pending marker");
        }
        state.metrics.record_submission(class.as_str(), "unavailable");
        return Err(ApiError::Unavailable("Queue unavailable".to_string()));
    }

    state.metrics.record_submission(class.as_str(), "accepted");
    tracing::info!(
        task_id = %task.task_id,
        queue = %class,
        language = %task.language,
        "Task accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            task_id: task.task_id,
            queue_class: class,
        }),
    ))
}

/// GET /task/:id - Result record, pending marker, or 404
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let lookup = state.store.lookup(&task_id).await.map_err(|e| {
        tracing::error!(task_id = %task_id, error = %e, "Failed to look up task");
        ApiError::Unavailable("Result store unavailable".to_string())
    })?;

    match lookup {
        TaskLookup::Finished(record) => Ok(Json(record).into_response()),
        TaskLookup::Pending => Ok(Json(PendingResponse {
            task_id,
            status: ResultStatus::Pending,
        })
        .into_response()),
        TaskLookup::Missing => Err(ApiError::NotFound("Task not found".to_string())),
    }
}

/// Query parameters for `GET /results/:class`.
#[derive(Debug, Deserialize)]
pub struct RecentParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_RESULTS_LIMIT
}

/// GET /results/:class - Newest committed records for a queue class
pub async fn recent_results(
    State(state): State<AppState>,
    Path(class): Path<String>,
    Query(params): Query<RecentParams>,
) -> Result<Json<Vec<ResultRecord>>, ApiError> {
    let class = QueueClass::from_str(&class).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let limit = params.limit.min(MAX_RESULTS_LIMIT);

    let records = state.store.recent(class, limit).await.map_err(|e| {
        tracing::error!(queue = %class, error = %e, "Failed to read results list");
        ApiError::Unavailable("Result store unavailable".to_string())
    })?;

    Ok(Json(records))
}
