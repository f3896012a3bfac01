//! # Command-Line Interface
//!
//! A thin driver for inspecting and exercising lifecycle plugins outside
//! the container workflow.
//!
//! ## Commands
//!
//! | Command | Purpose |
//! |---------|---------|
//! | `list` | Plugin executables found in the plugin directory |
//! | `flags` | Options each plugin declares |
//! | `options` | Environment, volumes and ports plugins contribute |
//! | `hooks` | Runs the before/with/after hooks for an instance |
//!
//! ## Output Formats
//!
//! All commands support the `--format` flag:
//! - `text` (default) - Human-readable output
//! - `json` - Machine-parseable JSON
//!
//! Diagnostics go to stderr through `tracing`; `RUST_LOG` overrides
//! `--log-level`.
//!
//! ## Entry Point
//!
//! Call [`run()`] to parse arguments and execute the appropriate command.

mod app;
mod output;
mod plugin_cmd;

pub use app::{run, Cli};
pub use output::{Output, OutputFormat};
pub use plugin_cmd::PluginCommands;
