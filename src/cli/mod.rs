//! Command-line interface for trainforge.
//!
//! Provides the long-running `serve` command with its operator console and
//! one-shot `train`, `export`, `test` and `projects` commands.

mod commands;
mod console;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
pub use console::ConsoleCommand;
