//! Remote code execution.
//!
//! This module turns a [`Task`] into a request against a Piston-compatible
//! sandbox and normalizes the answer into a [`RemoteOutcome`]:
//!
//! - **Executor**: the seam the worker calls through
//! - **PistonClient**: HTTP implementation of the executor
//!
//! # Request shape
//!
//! ```text
//! POST {executor_url}
//! {
//!   "language": "python",
//!   "version": "*",
//!   "files": [{ "name": "main.py", "content": "print('hi')" }],
//!   "stdin": ""
//! }
//! ```
//!
//! The client makes exactly one attempt. Transport failures and non-2xx
//! responses come back as [`ExecutionError`]; the caller decides what they
//! mean for the task.

pub mod piston;

use async_trait::async_trait;

use crate::error::ExecutionError;
use crate::scheduler::{Language, Task};

pub use piston::{PistonClient, DEFAULT_EXECUTOR_URL};

/// Version sent when a task does not pin one: any installed runtime.
pub const ANY_VERSION: &str = "*";

/// Normalized sandbox answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// The program ran; `output` is its combined stdout/stderr.
    Ran { output: String },
    /// The sandbox accepted the request but did not run the program.
    NotRan { error_message: String },
}

/// Executes a task remotely.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<RemoteOutcome, ExecutionError>;
}

/// File extension the sandbox expects for `language`.
///
/// Unknown languages fall back to `txt`; the sandbox may then reject them.
pub fn file_extension(language: &Language) -> &'static str {
    match language {
        Language::Python => "py",
        Language::JavaScript => "js",
        Language::Java => "java",
        Language::Other(_) => "txt",
    }
}

/// Name of the single source file sent with the request.
pub fn source_file_name(language: &Language) -> String {
    format!("main.{}", file_extension(language))
}
