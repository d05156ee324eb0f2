//! Task definitions for the scheduler.
//!
//! This module defines the core types that flow through the pipeline:
//!
//! - `Task`: User-submitted code plus execution parameters
//! - `QueueClass`: Priority tier a task is queued under
//! - `Outcome`: Normalized result of one execution attempt
//! - `ResultRecord`: Terminal, expiring record of a task's outcome

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskError;

/// Priority tier of a task.
///
/// `Run` tasks are interactive checks and are always dequeued before
/// `Submit` tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueClass {
    #[default]
    Run,
    Submit,
}

impl QueueClass {
    /// Classes in dequeue priority order.
    pub const PRIORITY_ORDER: [QueueClass; 2] = [QueueClass::Run, QueueClass::Submit];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueClass::Run => "run",
            QueueClass::Submit => "submit",
        }
    }

    /// Redis list holding pending entries of this class.
    pub fn queue_key(&self) -> &'static str {
        match self {
            QueueClass::Run => "runQueue",
            QueueClass::Submit => "submitQueue",
        }
    }

    /// Redis list holding the audit trail of committed results.
    pub fn results_key(&self) -> &'static str {
        match self {
            QueueClass::Run => "runResults",
            QueueClass::Submit => "submitResults",
        }
    }
}

impl fmt::Display for QueueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueClass {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "run" => Ok(QueueClass::Run),
            "submit" => Ok(QueueClass::Submit),
            other => Err(TaskError::UnknownAction(other.to_string())),
        }
    }
}

/// Source language of a task.
///
/// Unknown languages are carried through verbatim rather than rejected;
/// the sandbox decides whether it can run them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Language {
    Python,
    JavaScript,
    Java,
    Other(String),
}

impl Language {
    pub fn as_str(&self) -> &str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Java => "java",
            Language::Other(name) => name,
        }
    }
}

impl From<String> for Language {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Language::Python,
            "javascript" | "js" => Language::JavaScript,
            "java" => Language::Java,
            _ => Language::Other(value),
        }
    }
}

impl From<&str> for Language {
    fn from(value: &str) -> Self {
        Language::from(value.to_string())
    }
}

impl From<Language> for String {
    fn from(value: Language) -> Self {
        match value {
            Language::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of user-submitted code awaiting execution.
///
/// Immutable once enqueued and identified solely by `task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub language: Language,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub queue_class: QueueClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Expected output supplied by the caller; carried for graders, never used
    /// by the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
}

impl Task {
    /// Creates a task with no stdin, version or caller metadata.
    pub fn new(
        task_id: impl Into<String>,
        language: impl Into<Language>,
        code: impl Into<String>,
        queue_class: QueueClass,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            language: language.into(),
            code: code.into(),
            stdin: None,
            version: None,
            queue_class,
            question_id: None,
            user_id: None,
            expected_output: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_question(mut self, question_id: impl Into<String>) -> Self {
        self.question_id = Some(question_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_expected_output(mut self, output: impl Into<String>) -> Self {
        self.expected_output = Some(output.into());
        self
    }

    /// Parses a raw queue entry.
    ///
    /// Required fields are checked on the raw JSON first so that the task id
    /// can still be reported when the rest of the entry is unusable.
    pub fn parse_entry(raw: &str) -> Result<Task, InvalidEntry> {
        let value: Value = serde_json::from_str(raw).map_err(|e| InvalidEntry {
            task_id: None,
            error: TaskError::Malformed(e.to_string()),
        })?;

        let task_id = non_empty_str(&value, "taskId").map(str::to_string);
        let Some(task_id) = task_id else {
            return Err(InvalidEntry {
                task_id: None,
                error: TaskError::MissingField("taskId"),
            });
        };

        for field in ["language", "code"] {
            if non_empty_str(&value, field).is_none() {
                return Err(InvalidEntry {
                    task_id: Some(task_id),
                    error: TaskError::MissingField(field),
                });
            }
        }

        serde_json::from_value(value).map_err(|e| InvalidEntry {
            task_id: Some(task_id),
            error: TaskError::Malformed(e.to_string()),
        })
    }
}

fn non_empty_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// A queue entry that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidEntry {
    /// Task id, if it could be recovered from the entry.
    pub task_id: Option<String>,
    pub error: TaskError,
}

/// Status of a task as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Error,
    /// Accepted but not yet committed. Never stored in a `ResultRecord`.
    Pending,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Completed => write!(f, "completed"),
            ResultStatus::Error => write!(f, "error"),
            ResultStatus::Pending => write!(f, "pending"),
        }
    }
}

/// Why a task ended in `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The queue entry was malformed; execution was skipped.
    Validation,
    /// Transport failure, non-success status or sandbox-reported failure.
    Remote,
    /// The local execution deadline elapsed.
    Timeout,
}

/// Normalized outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { output: String },
    Failed { message: String, kind: ErrorKind },
}

impl Outcome {
    pub fn failed(message: impl Into<String>, kind: ErrorKind) -> Self {
        Outcome::Failed {
            message: message.into(),
            kind,
        }
    }

    /// Short label used in logs and metrics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Outcome::Completed { .. } => "completed",
            Outcome::Failed {
                kind: ErrorKind::Validation,
                ..
            } => "validation_error",
            Outcome::Failed {
                kind: ErrorKind::Remote,
                ..
            } => "remote_error",
            Outcome::Failed {
                kind: ErrorKind::Timeout,
                ..
            } => "timeout",
        }
    }
}

/// Terminal record of a task's outcome.
///
/// Created once on commit, never mutated, and expired by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub task_id: String,
    pub status: ResultStatus,
    pub output: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ResultRecord {
    /// Builds the record for `outcome`, stamped with the current time.
    pub fn from_outcome(task_id: impl Into<String>, outcome: Outcome) -> Self {
        let (status, output, error_kind) = match outcome {
            Outcome::Completed { output } => (ResultStatus::Completed, output, None),
            Outcome::Failed { message, kind } => (ResultStatus::Error, message, Some(kind)),
        };
        Self {
            task_id: task_id.into(),
            status,
            output,
            completed_at: Utc::now(),
            error_kind,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Completed
    }
}

/// Result of looking a task up in the result store.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskLookup {
    Finished(ResultRecord),
    /// Accepted by the submission API, no result committed yet.
    Pending,
    /// Never submitted, or already expired.
    Missing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_class_keys() {
        assert_eq!(QueueClass::Run.queue_key(), "runQueue");
        assert_eq!(QueueClass::Submit.queue_key(), "submitQueue");
        assert_eq!(QueueClass::Run.results_key(), "runResults");
        assert_eq!(QueueClass::Submit.results_key(), "submitResults");
        assert_eq!(
            QueueClass::PRIORITY_ORDER,
            [QueueClass::Run, QueueClass::Submit]
        );
    }

    #[test]
    fn test_queue_class_from_str() {
        assert_eq!("run".parse::<QueueClass>(), Ok(QueueClass::Run));
        assert_eq!(" Submit ".parse::<QueueClass>(), Ok(QueueClass::Submit));
        assert_eq!(
            "grade".parse::<QueueClass>(),
            Err(TaskError::UnknownAction("grade".to_string()))
        );
    }

    #[test]
    fn test_language_aliases_and_unknown() {
        assert_eq!(Language::from("py"), Language::Python);
        assert_eq!(Language::from("JS"), Language::JavaScript);
        assert_eq!(Language::from("java"), Language::Java);
        assert_eq!(
            Language::from("unknownlang"),
            Language::Other("unknownlang".to_string())
        );
        assert_eq!(String::from(Language::JavaScript), "javascript");
        assert_eq!(String::from(Language::from("rust")), "rust");
    }

    #[test]
    fn test_task_wire_format_is_camel_case() {
        let task = Task::new("t1", "python", "print('hi')", QueueClass::Submit)
            .with_stdin("1 2")
            .with_question("q-7");
        let json = serde_json::to_value(&task).expect("task should serialize");

        assert_eq!(json["taskId"], "t1");
        assert_eq!(json["language"], "python");
        assert_eq!(json["queueClass"], "submit");
        assert_eq!(json["questionId"], "q-7");
        assert!(json.get("version").is_none());
    }

    #[test]
    fn test_parse_entry_valid() {
        let raw = r#"{"taskId":"t1","language":"python","code":"print('hi')","extra":true}"#;
        let task = Task::parse_entry(raw).expect("entry should parse");

        assert_eq!(task.task_id, "t1");
        assert_eq!(task.language, Language::Python);
        assert_eq!(task.queue_class, QueueClass::Run);
        assert!(task.stdin.is_none());
    }

    #[test]
    fn test_parse_entry_missing_code_keeps_task_id() {
        let err = Task::parse_entry(r#"{"taskId":"t9","language":"python"}"#)
            .expect_err("missing code must be rejected");
        assert_eq!(err.task_id.as_deref(), Some("t9"));
        assert_eq!(err.error, TaskError::MissingField("code"));

        let err = Task::parse_entry(r#"{"taskId":"t9","language":"python","code":""}"#)
            .expect_err("empty code must be rejected");
        assert_eq!(err.error, TaskError::MissingField("code"));

        let copy = err.clone();
        assert_eq!(copy, err);
    }

    #[test]
    fn test_parse_entry_without_task_id() {
        let err = Task::parse_entry(r#"{"language":"python","code":"x"}"#)
            .expect_err("missing id must be rejected");
        assert!(err.task_id.is_none());
        assert_eq!(err.error, TaskError::MissingField("taskId"));

        let err = Task::parse_entry("not json").expect_err("garbage must be rejected");
        assert!(err.task_id.is_none());
        assert!(matches!(err.error, TaskError::Malformed(_)));
    }

    #[test]
    fn test_parse_entry_wrong_type_is_malformed() {
        let raw = r#"{"taskId":"t3","language":"python","code":"x","stdin":42}"#;
        let err = Task::parse_entry(raw).expect_err("stdin must be a string");
        assert_eq!(err.task_id.as_deref(), Some("t3"));
        assert!(matches!(err.error, TaskError::Malformed(_)));
    }

    #[test]
    fn test_result_record_from_outcome() {
        let record = ResultRecord::from_outcome(
            "t1",
            Outcome::Completed {
                output: "hi\n".to_string(),
            },
        );
        assert!(record.is_success());
        assert_eq!(record.output, "hi\n");
        assert!(record.error_kind.is_none());

        let record =
            ResultRecord::from_outcome("t2", Outcome::failed("boom", ErrorKind::Timeout));
        assert_eq!(record.status, ResultStatus::Error);
        assert_eq!(record.output, "boom");
        assert_eq!(record.error_kind, Some(ErrorKind::Timeout));

        let json = serde_json::to_value(&record).expect("record should serialize");
        assert_eq!(json["status"], "error");
        assert_eq!(json["errorKind"], "timeout");
        assert!(json.get("completedAt").is_some());
    }

    #[test]
    fn test_outcome_kind_labels() {
        assert_eq!(
            Outcome::Completed {
                output: String::new()
            }
            .kind_label(),
            "completed"
        );
        assert_eq!(
            Outcome::failed("x", ErrorKind::Validation).kind_label(),
            "validation_error"
        );
        assert_eq!(
            Outcome::failed("x", ErrorKind::Remote).kind_label(),
            "remote_error"
        );
    }
}
