//! Command-line interface for coderun.
//!
//! Provides the service roles (`serve`, `worker`, `all`), the one-shot
//! `recover` sweep and the `submit`/`status` client commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
