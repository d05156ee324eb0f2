//! Piston sandbox client.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;
use crate::scheduler::Task;

use super::{source_file_name, Executor, RemoteOutcome, ANY_VERSION};

/// Public Piston endpoint.
pub const DEFAULT_EXECUTOR_URL: &str = "https://emkc.org/api/v2/piston/execute";

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    language: &'a str,
    version: &'a str,
    files: Vec<SourceFile<'a>>,
    stdin: &'a str,
}

#[derive(Debug, Serialize)]
struct SourceFile<'a> {
    name: String,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    run: Option<Stage>,
    #[serde(default)]
    compile: Option<Stage>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Stage {
    #[serde(default)]
    output: String,
    #[serde(default)]
    code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// HTTP client for a Piston-compatible `/execute` endpoint.
///
/// No request timeout is set; the worker bounds each call with its own
/// deadline.
#[derive(Debug, Clone)]
pub struct PistonClient {
    client: Client,
    url: String,
}

impl PistonClient {
    /// Creates a client for `url` using the transport's default timeouts.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn normalize(response: ExecuteResponse) -> RemoteOutcome {
    if let Some(run) = response.run {
        return RemoteOutcome::Ran { output: run.output };
    }

    if let Some(compile) = response.compile.filter(|c| c.code.unwrap_or(0) != 0) {
        return RemoteOutcome::NotRan {
            error_message: compile.output,
        };
    }

    RemoteOutcome::NotRan {
        error_message: response
            .message
            .unwrap_or_else(|| "Sandbox did not run the program".to_string()),
    }
}

#[async_trait]
impl Executor for PistonClient {
    async fn execute(&self, task: &Task) -> Result<RemoteOutcome, ExecutionError> {
        let request = ExecuteRequest {
            language: task.language.as_str(),
            version: task.version.as_deref().unwrap_or(ANY_VERSION),
            files: vec![SourceFile {
                name: source_file_name(&task.language),
                content: &task.code,
            }],
            stdin: task.stdin.as_deref().unwrap_or(""),
        };

        let http_response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ExecutionError::RequestFailed(e.to_string()))?;

        let status = http_response.status();
        let body = http_response
            .text()
            .await
            .map_err(|e| ExecutionError::RequestFailed(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.message)
                .unwrap_or(body);
            return Err(ExecutionError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let response: ExecuteResponse = serde_json::from_str(&body)
            .map_err(|e| ExecutionError::MalformedResponse(e.to_string()))?;

        Ok(normalize(response))
    }
}
