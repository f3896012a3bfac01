//! iscenv-lifecycler-example - a lifecycle plugin for exercising the host
//!
//! Flags:
//! - `fail`: operation name (e.g. `BeforeInstance`) that returns an error
//! - `exit`: operation name after which the process dies on its next call
//! - `message`: value of the `EXAMPLE_MESSAGE` environment variable
//!
//! With `ISCENV_EXAMPLE_RECORD` set, every call is appended to that file as
//! `<name> <Operation>`, plus `<name> shutdown` on a clean exit.

use std::cell::Cell;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use iscenv_plugins::plugin::{
    serve, FlagValues, InstanceState, Lifecycler, Operation, PluginFlags, PLUGIN_PREFIX,
};

const RECORD_ENV: &str = "ISCENV_EXAMPLE_RECORD";

struct Example {
    name: String,
    record: Option<PathBuf>,
    exit_pending: Cell<bool>,
}

impl Example {
    fn from_env() -> Self {
        let name = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .map(|stem| {
                stem.strip_prefix(PLUGIN_PREFIX)
                    .map(str::to_string)
                    .unwrap_or(stem)
            })
            .unwrap_or_else(|| "example".to_string());

        Self {
            name,
            record: std::env::var_os(RECORD_ENV).map(PathBuf::from),
            exit_pending: Cell::new(false),
        }
    }

    fn record(&self, event: &str) -> Result<()> {
        let Some(path) = &self.record else {
            return Ok(());
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open record file: {}", path.display()))?;
        writeln!(file, "{} {}", self.name, event)?;
        Ok(())
    }

    /// Bookkeeping shared by every operation
    fn enter(&self, operation: Operation, flags: &FlagValues) -> Result<()> {
        if self.exit_pending.get() {
            tracing::warn!(plugin = %self.name, "Exiting without a response");
            std::process::exit(3);
        }

        self.record(operation.as_str())?;

        if flag(flags, "fail") == Some(operation.as_str()) {
            bail!("{} asked to fail {}", self.name, operation);
        }
        if flag(flags, "exit") == Some(operation.as_str()) {
            self.exit_pending.set(true);
        }
        Ok(())
    }
}

fn flag<'a>(flags: &'a FlagValues, name: &str) -> Option<&'a str> {
    flags.get(name).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

impl Lifecycler for Example {
    fn flags(&self) -> Result<PluginFlags> {
        self.enter(Operation::Flags, &FlagValues::new())?;

        let mut flags = PluginFlags::new();
        flags.add_flag("fail", false, "", "Operation that should return an error")?;
        flags.add_flag("exit", false, "", "Operation after which the plugin dies")?;
        flags.add_flag("message", true, "hello", "Value of EXAMPLE_MESSAGE")?;
        Ok(flags)
    }

    fn environment(&self, version: &str, flags: &FlagValues) -> Result<Vec<String>> {
        self.enter(Operation::Environment, flags)?;

        let message = flags.get("message").and_then(|v| v.as_str()).unwrap_or("");
        Ok(vec![
            format!("EXAMPLE_MESSAGE={}", message),
            format!("EXAMPLE_VERSION={}", version),
        ])
    }

    fn volumes(&self, _version: &str, flags: &FlagValues) -> Result<Vec<String>> {
        self.enter(Operation::Volumes, flags)?;
        Ok(vec![format!("/srv/{}:/data/{}", self.name, self.name)])
    }

    fn ports(&self, _version: &str, flags: &FlagValues) -> Result<Vec<String>> {
        self.enter(Operation::Ports, flags)?;
        Ok(Vec::new())
    }

    fn before_instance(&self, state: &InstanceState) -> Result<()> {
        self.enter(Operation::BeforeInstance, &state.flags)
    }

    fn with_instance(&self, state: &InstanceState) -> Result<()> {
        self.enter(Operation::WithInstance, &state.flags)
    }

    fn after_instance(&self, state: &InstanceState) -> Result<()> {
        self.enter(Operation::AfterInstance, &state.flags)
    }
}

fn main() -> ExitCode {
    let plugin = Example::from_env();

    if let Err(e) = serve(&plugin) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = plugin.record("shutdown") {
        tracing::warn!(error = %e, "Failed to record shutdown");
    }
    ExitCode::SUCCESS
}
