//! Main CLI application structure

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use super::output::{Output, OutputFormat};
use super::plugin_cmd::{self, PluginCommands};
use crate::config::Config;
use crate::logging::{self, LogLevel};

#[derive(Parser)]
#[command(name = "iscenv-plugins")]
#[command(author, version, about = "Inspect and exercise iscenv lifecycle plugins")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Log level for this process and every plugin it spawns
    #[arg(long, global = true, env = "ISCENV_LOG_LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Configuration file (defaults to the per-user config.toml)
    #[arg(long, global = true, env = "ISCENV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding iscenv-lifecycler-* executables
    #[arg(long, global = true, env = "ISCENV_PLUGIN_DIR")]
    pub plugin_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: PluginCommands,
}

/// Run the CLI application
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if cli.log_json {
        config.log_json = true;
    }
    if let Some(dir) = cli.plugin_dir {
        config.plugin_dir = Some(dir);
    }

    logging::init(config.log_level, config.log_json)?;

    let output = Output::new(cli.format);
    plugin_cmd::run(cli.command, &output, &config)
}
