//! Plugin commands

use anyhow::{bail, Result};
use clap::Subcommand;
use serde::Serialize;

use super::output::Output;
use crate::config::{Config, FlagSettings};
use crate::plugin::{InstanceState, LifecyclerManager, PluginLoader, PluginSource};

#[derive(Subcommand)]
pub enum PluginCommands {
    /// List plugin executables in the plugin directory
    List,

    /// Activate plugins and show the flags they declare
    Flags {
        /// Plugins to activate (defaults to `plugins` from the config)
        plugins: Vec<String>,
    },

    /// Show the environment, volumes and ports plugins contribute
    Options {
        /// Product version the instance will run
        #[arg(long)]
        isc_version: String,

        /// Flag value as <plugin>-<flag>=<value>
        #[arg(long = "plugin-flag", short = 'p', value_name = "KEY=VALUE")]
        plugin_flags: Vec<String>,

        /// Plugins to activate (defaults to `plugins` from the config)
        plugins: Vec<String>,
    },

    /// Run the before, with and after hooks for an instance
    Hooks {
        /// Instance name
        #[arg(long)]
        instance: String,

        /// Product version of the instance
        #[arg(long)]
        isc_version: String,

        /// Container identifier, if one already exists
        #[arg(long)]
        id: Option<String>,

        /// Flag value as <plugin>-<flag>=<value>
        #[arg(long = "plugin-flag", short = 'p', value_name = "KEY=VALUE")]
        plugin_flags: Vec<String>,

        /// Fail when any AfterInstance hook fails
        #[arg(long)]
        strict: bool,

        /// Plugins to activate (defaults to `plugins` from the config)
        plugins: Vec<String>,
    },
}

pub fn run(cmd: PluginCommands, output: &Output, config: &Config) -> Result<()> {
    match cmd {
        PluginCommands::List => list_plugins(output, config),
        PluginCommands::Flags { plugins } => show_flags(output, config, plugins),
        PluginCommands::Options {
            isc_version,
            plugin_flags,
            plugins,
        } => show_options(output, config, plugins, &plugin_flags, &isc_version),
        PluginCommands::Hooks {
            instance,
            isc_version,
            id,
            plugin_flags,
            strict,
            plugins,
        } => {
            let mut state = InstanceState::new(instance, isc_version);
            if let Some(id) = id {
                state = state.with_id(id);
            }
            run_hooks(output, config, plugins, &plugin_flags, &state, strict)
        }
    }
}

fn list_plugins(output: &Output, config: &Config) -> Result<()> {
    let manager_config = config.manager_config();
    let loader = PluginLoader::new(manager_config.plugin_dir);
    let plugins = loader.discover()?;

    if output.is_json() {
        let items: Vec<_> = plugins
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "path": p.executable_path().map(|path| path.display().to_string()),
                })
            })
            .collect();
        output.data(&items);
    } else if plugins.is_empty() {
        println!("No plugins found in {}", loader.plugin_dir().display());
        println!();
        println!("Plugins are executables named 'iscenv-lifecycler-<name>'.");
    } else {
        println!("{:<20} PATH", "NAME");
        println!("{}", "-".repeat(70));
        for plugin in &plugins {
            let path = match &plugin.source {
                PluginSource::Executable(path) => path.display().to_string(),
                PluginSource::Builtin => "(built-in)".to_string(),
            };
            println!("{:<20} {}", plugin.name, path);
        }
    }

    Ok(())
}

fn selected(config: &Config, plugins: Vec<String>) -> Result<Vec<String>> {
    let plugins = if plugins.is_empty() {
        config.plugins.clone()
    } else {
        plugins
    };

    if plugins.is_empty() {
        bail!("No plugins named on the command line or in the configuration");
    }
    Ok(plugins)
}

/// Activates `plugins` and resolves their flags
fn activate(
    output: &Output,
    config: &Config,
    plugins: Vec<String>,
    overrides: &[String],
) -> Result<LifecyclerManager> {
    let plugins = selected(config, plugins)?;

    let mut settings: FlagSettings = config.flag_settings()?;
    for assignment in overrides {
        settings.add_override(assignment)?;
    }

    let mut manager = LifecyclerManager::new(config.manager_config());
    manager.activate_plugins(plugins.as_slice())?;

    let known: Vec<String> = manager.declared_flags().into_keys().collect();
    for key in settings.unknown_overrides(&known) {
        output.warn(&format!("No active plugin declares flag {}", key));
    }

    manager.resolve_flags(&settings)?;
    Ok(manager)
}

#[derive(Serialize)]
struct FlagRow<'a> {
    plugin: &'a str,
    flag: String,
    default: &'a serde_json::Value,
    has_config: bool,
    usage: &'a str,
}

fn show_flags(output: &Output, config: &Config, plugins: Vec<String>) -> Result<()> {
    let mut manager = activate(output, config, plugins, &[])?;

    let rows: Vec<FlagRow> = manager
        .declared_flags()
        .into_iter()
        .map(|(flag, (plugin, declared))| FlagRow {
            plugin,
            flag,
            default: &declared.default_value,
            has_config: declared.has_config,
            usage: &declared.usage,
        })
        .collect();

    if output.is_json() {
        output.data(&rows);
    } else if rows.is_empty() {
        println!("No flags declared.");
    } else {
        println!("{:<30} {:<16} {:<7} USAGE", "FLAG", "DEFAULT", "CONFIG");
        println!("{}", "-".repeat(80));
        for row in &rows {
            println!(
                "{:<30} {:<16} {:<7} {}",
                row.flag,
                row.default.to_string(),
                if row.has_config { "yes" } else { "no" },
                row.usage
            );
        }
    }

    manager.close();
    Ok(())
}

fn show_options(
    output: &Output,
    config: &Config,
    plugins: Vec<String>,
    overrides: &[String],
    version: &str,
) -> Result<()> {
    let mut manager = activate(output, config, plugins, overrides)?;
    let options = manager.start_options(version)?;
    manager.close();

    if output.is_json() {
        output.data(&options);
        return Ok(());
    }

    for (label, values) in [
        ("Environment", &options.environment),
        ("Volumes", &options.volumes),
        ("Ports", &options.ports),
    ] {
        println!("{}:", label);
        if values.is_empty() {
            println!("  (none)");
        }
        for value in values {
            println!("  {}", value);
        }
    }

    Ok(())
}

fn run_hooks(
    output: &Output,
    config: &Config,
    plugins: Vec<String>,
    overrides: &[String],
    instance: &InstanceState,
    strict: bool,
) -> Result<()> {
    let mut manager = activate(output, config, plugins, overrides)?;

    let report = manager.run_instance_operation(instance, |state| {
        tracing::info!(instance = %state.name, "Bring-up is left to the container runtime");
        Ok(())
    })?;
    manager.close();

    for failure in &report.after.failures {
        output.warn(&failure.to_string());
    }

    let completed = report.after.completed.clone();
    if strict {
        report.into_result()?;
    }

    if output.is_json() {
        output.data(&serde_json::json!({
            "instance": instance.name,
            "completed": completed,
        }));
    } else {
        output.success(&format!(
            "Ran hooks for {} ({} plugin(s) completed)",
            instance.name,
            completed.len()
        ));
    }

    Ok(())
}
