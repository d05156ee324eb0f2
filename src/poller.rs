//! Polling client for the submission API.
//!
//! Submits a task, then asks `GET /task/:id` on a fixed interval until the
//! task is committed. "Not found" is treated like "pending", since a task can
//! be between submission and its first store write; give-up is the caller's
//! choice through [`PollPolicy::max_wait`].
//!
//! # Example
//!
//! ```rust,ignore
//! use coderun::api::SubmitRequest;
//! use coderun::poller::{PollPolicy, TaskClient};
//!
//! let client = TaskClient::new("http://localhost:3000");
//! let record = client
//!     .run_to_completion(&SubmitRequest::new("python", "print('hi')"), &PollPolicy::default())
//!     .await?;
//! println!("{}", record.output);
//! ```

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::{ErrorResponse, SubmitRequest, SubmitResponse};
use crate::error::PollError;
use crate::scheduler::{ResultRecord, ResultStatus, TaskLookup};

/// How often to poll and when to give up.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` polls until the task finishes.
    pub max_wait: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_wait: None,
        }
    }
}

impl PollPolicy {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }
}

/// `GET /task/:id` body; either a committed record or a pending marker.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TaskBody {
    Record(ResultRecord),
    Pending { status: ResultStatus },
}

/// HTTP client for the submission API.
#[derive(Debug, Clone)]
pub struct TaskClient {
    client: Client,
    base_url: String,
}

impl TaskClient {
    /// Creates a client for the API at `base_url` (e.g. `http://localhost:3000`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Submits a task and returns its id and queue class.
    ///
    /// # Errors
    ///
    /// Returns `PollError::ApiError` when the API rejects the submission.
    pub async fn submit(&self, request: &SubmitRequest) -> Result<SubmitResponse, PollError> {
        let response = self
            .client
            .post(format!("{}/task", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| PollError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PollError::RequestFailed(e.to_string()))?;

        if !status.is_success() {
            return Err(api_error(status, body));
        }

        serde_json::from_str(&body).map_err(|e| PollError::ParseError(e.to_string()))
    }

    /// Looks a task up once. The id is percent-encoded as one path segment.
    pub async fn status(&self, task_id: &str) -> Result<TaskLookup, PollError> {
        let response = self
            .client
            .get(format!(
                "{}/task/{}",
                self.base_url,
                urlencoding::encode(task_id)
            ))
            .send()
            .await
            .map_err(|e| PollError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(TaskLookup::Missing);
        }

        let body = response
            .text()
            .await
            .map_err(|e| PollError::RequestFailed(e.to_string()))?;

        if !status.is_success() {
            return Err(api_error(status, body));
        }

        match serde_json::from_str::<TaskBody>(&body) {
            Ok(TaskBody::Record(record)) => Ok(TaskLookup::Finished(record)),
            Ok(TaskBody::Pending {
                status: ResultStatus::Pending,
                ..
            }) => Ok(TaskLookup::Pending),
            Ok(TaskBody::Pending { status, .. }) => Err(PollError::ParseError(format!(
                "status '{}' without a result record",
                status
            ))),
            Err(e) => Err(PollError::ParseError(e.to_string())),
        }
    }

    /// Polls until the task has a committed record.
    ///
    /// Not-found, pending, transport failures and 5xx answers all mean
    /// "try again"; any other API error is returned at once.
    ///
    /// # Errors
    ///
    /// Returns `PollError::GaveUp` once `policy.max_wait` has elapsed.
    pub async fn poll(&self, task_id: &str, policy: &PollPolicy) -> Result<ResultRecord, PollError> {
        let started = Instant::now();

        loop {
            match self.status(task_id).await {
                Ok(TaskLookup::Finished(record)) => return Ok(record),
                Ok(TaskLookup::Pending) | Ok(TaskLookup::Missing) => {
                    debug!(task_id = %task_id, "Task not finished yet");
                }
                Err(PollError::RequestFailed(e)) => {
                    warn!(task_id = %task_id, error = %e, "Poll request failed, retrying");
                }
                Err(PollError::ApiError { code, message }) if code >= 500 => {
                    warn!(task_id = %task_id, code = code, error = %message, "API unavailable, retrying");
                }
                Err(e) => return Err(e),
            }

            if let Some(max_wait) = policy.max_wait {
                if started.elapsed() + policy.interval > max_wait {
                    return Err(PollError::GaveUp {
                        task_id: task_id.to_string(),
                        waited: started.elapsed(),
                    });
                }
            }

            tokio::time::sleep(policy.interval).await;
        }
    }

    /// Submits a task and polls it to completion.
    pub async fn run_to_completion(
        &self,
        request: &SubmitRequest,
        policy: &PollPolicy,
    ) -> Result<ResultRecord, PollError> {
        let accepted = self.submit(request).await?;
        debug!(task_id = %accepted.task_id, queue = %accepted.queue_class, "Task submitted");
        self.poll(&accepted.task_id, policy).await
    }
}

fn api_error(status: StatusCode, body: String) -> PollError {
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error)
        .unwrap_or(body);
    PollError::ApiError {
        code: status.as_u16(),
        message,
    }
}
