//! Lifecycler manager
//!
//! Owns every activated plugin for the lifetime of one host command:
//! resolves and spawns them, collects their flags, drives the hook phases in
//! activation order and tears the processes down exactly once.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::contract::{InstanceState, Lifecycler};
use super::flags::{FlagValues, PluginFlag, PluginFlags};
use super::handle::PluginHandle;
use super::hooks::{self, AfterReport, OperationReport, StartOptions};
use super::loader::{PluginDescriptor, PluginLoader, PluginSource};
use super::protocol::{Handshake, PROTOCOL_VERSION};
use super::server::ServeArgs;
use super::transport::{LocalTransport, StdioTransport, Transport};
use crate::config::FlagSettings;
use crate::error::{LifecyclerError, Result};
use crate::logging::LogLevel;

/// Global arguments applied uniformly to every spawned plugin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginArgs {
    pub log_level: LogLevel,
    pub log_json: bool,
}

/// What to do when one plugin in a batch fails to activate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPolicy {
    /// Tear down everything activated so far and return the error
    #[default]
    FailFast,

    /// Log the failure and continue without that plugin
    SkipFailed,
}

/// Construction-time settings for a [`LifecyclerManager`]
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory holding `iscenv-lifecycler-*` executables
    pub plugin_dir: PathBuf,

    pub args: PluginArgs,

    pub policy: ActivationPolicy,

    /// Upper bound on a single hook call
    pub call_timeout: Duration,

    /// Upper bound on the handshake after spawn
    pub handshake_timeout: Duration,

    /// How long a plugin may take to exit once its input closes
    pub shutdown_grace: Duration,

    /// Extra environment for spawned plugins
    pub env: Vec<(String, String)>,
}

impl ManagerConfig {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            args: PluginArgs::default(),
            policy: ActivationPolicy::default(),
            call_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            env: Vec::new(),
        }
    }

    /// `plugins/` next to the running executable, or the working directory
    pub fn default_plugin_dir() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("plugins")))
            .unwrap_or_else(|| PathBuf::from("plugins"))
    }
}

/// Progress of one lifecycler through the current instance operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Idle,
    Before,
    With,
}

/// A live, activated plugin
pub struct ActivatedLifecycler {
    pub descriptor: PluginDescriptor,
    pub(crate) handle: PluginHandle,
    pub declared_flags: PluginFlags,
    pub resolved_flags: FlagValues,
    pub(crate) progress: Progress,
}

impl ActivatedLifecycler {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// `state` carrying this plugin's resolved flags
    pub(crate) fn state_for(&self, state: &InstanceState) -> InstanceState {
        state.scoped(&self.resolved_flags)
    }

    fn close(&mut self) {
        if let Err(e) = self.handle.close() {
            tracing::warn!(plugin = %self.descriptor.name, error = %e, "Failed to close plugin");
        }
    }
}

/// Coordinates every activated lifecycle plugin
pub struct LifecyclerManager {
    config: ManagerConfig,
    loader: PluginLoader,
    builtins: HashMap<String, Box<dyn Lifecycler>>,
    lifecyclers: Vec<ActivatedLifecycler>,
    activated: bool,
    closed: bool,
}

impl LifecyclerManager {
    pub fn new(config: ManagerConfig) -> Self {
        let loader = PluginLoader::new(config.plugin_dir.clone());
        Self {
            config,
            loader,
            builtins: HashMap::new(),
            lifecyclers: Vec::new(),
            activated: false,
            closed: false,
        }
    }

    /// Registers an in-process lifecycler under `name`
    ///
    /// Built-ins take precedence over executables of the same name and are
    /// served through the same protocol path.
    pub fn register_builtin(&mut self, name: impl Into<String>, plugin: Box<dyn Lifecycler>) {
        self.builtins.insert(name.into(), plugin);
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    /// Activated lifecyclers, in activation order
    pub fn lifecyclers(&self) -> &[ActivatedLifecycler] {
        &self.lifecyclers
    }

    /// Activates `names` in order; intended to be called once
    pub fn activate_plugins<S: AsRef<str>>(&mut self, names: &[S]) -> Result<()> {
        if self.closed {
            return Err(LifecyclerError::InvalidState("manager already closed"));
        }
        if self.activated {
            return Err(LifecyclerError::InvalidState("plugins already activated"));
        }
        self.activated = true;

        for name in names {
            let name = name.as_ref();
            match self.activate_one(name) {
                Ok(lifecycler) => {
                    tracing::info!(
                        plugin = %name,
                        flags = lifecycler.declared_flags.len(),
                        "Activated lifecycle plugin"
                    );
                    self.lifecyclers.push(lifecycler);
                }
                Err(e) if self.config.policy == ActivationPolicy::SkipFailed => {
                    tracing::warn!(plugin = %name, error = %e, "Skipping plugin that failed to activate");
                }
                Err(e) => {
                    tracing::error!(plugin = %name, error = %e, "Plugin activation failed; rolling back");
                    self.shutdown();
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn activate_one(&mut self, name: &str) -> Result<ActivatedLifecycler> {
        if self.lifecyclers.iter().any(|l| l.name() == name) {
            return Err(LifecyclerError::activation(
                name,
                LifecyclerError::InvalidState("plugin requested more than once"),
            ));
        }

        let (descriptor, transport) = self.launch(name)?;

        let hello = Handshake {
            protocol: PROTOCOL_VERSION,
            plugin: name.to_string(),
            log_level: self.config.args.log_level,
            log_json: self.config.args.log_json,
        };
        let mut handle = PluginHandle::connect(
            transport,
            &hello,
            self.config.handshake_timeout,
            self.config.call_timeout,
        )
        .map_err(|e| LifecyclerError::activation(name, e))?;

        let declared_flags = match handle.flags() {
            Ok(flags) => flags,
            Err(e) => {
                if let Err(close_err) = handle.close() {
                    tracing::warn!(plugin = %name, error = %close_err, "Failed to close plugin");
                }
                return Err(LifecyclerError::activation(name, e));
            }
        };

        let mut lifecycler = ActivatedLifecycler {
            descriptor,
            handle,
            resolved_flags: declared_flags.defaults(),
            declared_flags,
            progress: Progress::Idle,
        };

        if let Err(e) = self.check_namespace(&lifecycler) {
            lifecycler.close();
            return Err(e);
        }

        Ok(lifecycler)
    }

    fn launch(&mut self, name: &str) -> Result<(PluginDescriptor, Box<dyn Transport>)> {
        if let Some(plugin) = self.builtins.remove(name) {
            let descriptor = PluginDescriptor {
                name: name.to_string(),
                source: PluginSource::Builtin,
            };
            return Ok((descriptor, Box::new(LocalTransport::new(plugin))));
        }

        let descriptor = self.loader.resolve(name)?;
        let path = descriptor
            .executable_path()
            .map(|p| p.to_path_buf())
            .unwrap_or_default();

        let args = ServeArgs {
            log_level: self.config.args.log_level,
            log_json: self.config.args.log_json,
        }
        .to_args();

        tracing::debug!(plugin = %name, path = %path.display(), "Spawning plugin");
        let transport =
            StdioTransport::spawn(&path, &args, &self.config.env, self.config.shutdown_grace)
                .map_err(|source| {
                    LifecyclerError::activation(
                        name,
                        LifecyclerError::Spawn {
                            path: path.clone(),
                            source,
                        },
                    )
                })?;

        Ok((descriptor, Box::new(transport)))
    }

    /// Rejects a plugin whose namespaced flags clash with an active plugin's
    fn check_namespace(&self, candidate: &ActivatedLifecycler) -> Result<()> {
        let taken = self.declared_flags();
        for flag in candidate.declared_flags.iter() {
            let key = flag.namespaced(candidate.name());
            if taken.contains_key(&key) {
                return Err(LifecyclerError::FlagCollision { flag: key });
            }
        }
        Ok(())
    }

    /// Every declared flag of every active plugin, keyed `<plugin>-<flag>`
    pub fn declared_flags(&self) -> BTreeMap<String, (&str, &PluginFlag)> {
        self.lifecyclers
            .iter()
            .flat_map(|l| {
                l.declared_flags
                    .iter()
                    .map(move |f| (f.namespaced(l.name()), (l.name(), f)))
            })
            .collect()
    }

    /// Resolves every plugin's flag values from `settings`
    pub fn resolve_flags(&mut self, settings: &FlagSettings) -> anyhow::Result<()> {
        for lifecycler in &mut self.lifecyclers {
            lifecycler.resolved_flags =
                settings.resolve(&lifecycler.descriptor.name, &lifecycler.declared_flags)?;
        }
        Ok(())
    }

    /// Environment, volumes and ports contributed by every plugin
    pub fn start_options(&mut self, version: &str) -> Result<StartOptions> {
        self.ensure_open()?;
        hooks::start_options(&mut self.lifecyclers, version)
    }

    pub fn before_instance(&mut self, instance: &InstanceState) -> Result<()> {
        self.ensure_open()?;
        hooks::before_instance(&mut self.lifecyclers, instance)
    }

    pub fn with_instance(&mut self, instance: &InstanceState) -> Result<()> {
        self.ensure_open()?;
        hooks::with_instance(&mut self.lifecyclers, instance)
    }

    pub fn after_instance(&mut self, instance: &InstanceState) -> Result<AfterReport> {
        self.ensure_open()?;
        hooks::after_instance(&mut self.lifecyclers, instance)
    }

    /// Runs before, `bring_up`, with and after for one instance operation
    pub fn run_instance_operation<F>(
        &mut self,
        instance: &InstanceState,
        bring_up: F,
    ) -> Result<OperationReport>
    where
        F: FnOnce(&InstanceState) -> anyhow::Result<()>,
    {
        self.ensure_open()?;
        hooks::run_instance_operation(&mut self.lifecyclers, instance, bring_up)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(LifecyclerError::InvalidState("manager already closed"));
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        for mut lifecycler in self.lifecyclers.drain(..) {
            tracing::debug!(plugin = %lifecycler.descriptor.name, "Closing plugin");
            lifecycler.close();
        }
    }

    /// Terminates every plugin process; later calls are no-ops
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shutdown();
        self.builtins.clear();
    }
}

impl Drop for LifecyclerManager {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::hooks::tests::{recorder, Fake};
    use serde_json::json;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> LifecyclerManager {
        LifecyclerManager::new(ManagerConfig::new(dir.path()))
    }

    #[test]
    fn activates_builtins_in_order() {
        let dir = TempDir::new().unwrap();
        let calls = recorder();
        let mut manager = manager(&dir);
        manager.register_builtin("b", Box::new(Fake::new("b", &calls)));
        manager.register_builtin("a", Box::new(Fake::new("a", &calls)));

        manager.activate_plugins(&["b", "a"]).unwrap();

        let names: Vec<_> = manager.lifecyclers().iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(calls.lock().unwrap().as_slice(), ["b Flags", "a Flags"]);
    }

    #[test]
    fn missing_plugin_rolls_back_batch() {
        let dir = TempDir::new().unwrap();
        let calls = recorder();
        let mut manager = manager(&dir);
        manager.register_builtin("a", Box::new(Fake::new("a", &calls)));

        let err = manager.activate_plugins(&["a", "b"]).unwrap_err();

        assert!(matches!(err, LifecyclerError::PluginNotFound { ref name, .. } if name == "b"));
        assert!(manager.lifecyclers().is_empty());
    }

    #[test]
    fn skip_failed_policy_keeps_the_rest() {
        let dir = TempDir::new().unwrap();
        let calls = recorder();
        let mut config = ManagerConfig::new(dir.path());
        config.policy = ActivationPolicy::SkipFailed;
        let mut manager = LifecyclerManager::new(config);
        manager.register_builtin("a", Box::new(Fake::new("a", &calls)));
        manager.register_builtin("c", Box::new(Fake::new("c", &calls)));

        manager.activate_plugins(&["a", "missing", "c"]).unwrap();

        let names: Vec<_> = manager.lifecyclers().iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn flags_failure_is_activation_failure() {
        let dir = TempDir::new().unwrap();
        let calls = recorder();
        let mut manager = manager(&dir);
        manager.register_builtin("a", Box::new(Fake::new("a", &calls).failing("Flags")));

        let err = manager.activate_plugins(&["a"]).unwrap_err();

        match err {
            LifecyclerError::ActivationFailed { plugin, source } => {
                assert_eq!(plugin, "a");
                assert!(matches!(*source, LifecyclerError::HookFailed { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(manager.lifecyclers().is_empty());
    }

    #[test]
    fn namespaced_flag_collision_is_rejected() {
        let dir = TempDir::new().unwrap();
        let calls = recorder();
        let mut manager = manager(&dir);
        manager.register_builtin("a", Box::new(Fake::new("a", &calls).with_flag("b-c", json!(1))));
        manager.register_builtin("a-b", Box::new(Fake::new("a-b", &calls).with_flag("c", json!(2))));

        let err = manager.activate_plugins(&["a", "a-b"]).unwrap_err();
        assert!(matches!(err, LifecyclerError::FlagCollision { ref flag } if flag == "a-b-c"));
        assert!(manager.lifecyclers().is_empty());
    }

    #[test]
    fn same_bare_flag_in_two_plugins_is_fine() {
        let dir = TempDir::new().unwrap();
        let calls = recorder();
        let mut manager = manager(&dir);
        manager.register_builtin("p1", Box::new(Fake::new("p1", &calls).with_flag("timeout", json!(10))));
        manager.register_builtin("p2", Box::new(Fake::new("p2", &calls).with_flag("timeout", json!(20))));

        manager.activate_plugins(&["p1", "p2"]).unwrap();

        let declared = manager.declared_flags();
        assert_eq!(declared["p1-timeout"].1.default_value, json!(10));
        assert_eq!(declared["p2-timeout"].1.default_value, json!(20));
        assert_eq!(manager.lifecyclers()[0].resolved_flags["timeout"], json!(10));
        assert_eq!(manager.lifecyclers()[1].resolved_flags["timeout"], json!(20));
    }

    #[test]
    fn duplicate_name_in_batch_fails() {
        let dir = TempDir::new().unwrap();
        let calls = recorder();
        let mut manager = manager(&dir);
        manager.register_builtin("a", Box::new(Fake::new("a", &calls)));

        let err = manager.activate_plugins(&["a", "a"]).unwrap_err();
        assert!(matches!(err, LifecyclerError::ActivationFailed { .. }));
    }

    #[test]
    fn activation_is_single_use() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir);
        manager.activate_plugins::<&str>(&[]).unwrap();

        let err = manager.activate_plugins(&["a"]).unwrap_err();
        assert!(matches!(err, LifecyclerError::InvalidState(_)));
    }

    #[test]
    fn close_is_idempotent_and_final() {
        let dir = TempDir::new().unwrap();
        let calls = recorder();
        let mut manager = manager(&dir);
        manager.register_builtin("a", Box::new(Fake::new("a", &calls)));
        manager.activate_plugins(&["a"]).unwrap();

        manager.close();
        manager.close();

        assert!(manager.lifecyclers().is_empty());
        let err = manager
            .before_instance(&InstanceState::new("dev", "1"))
            .unwrap_err();
        assert!(matches!(err, LifecyclerError::InvalidState(_)));
    }

    #[test]
    fn with_and_after_require_the_earlier_phases() {
        let dir = TempDir::new().unwrap();
        let calls = recorder();
        let mut manager = manager(&dir);
        manager.register_builtin("a", Box::new(Fake::new("a", &calls)));
        manager.activate_plugins(&["a"]).unwrap();
        let state = InstanceState::new("dev", "1");

        let err = manager.with_instance(&state).unwrap_err();
        assert!(matches!(err, LifecyclerError::InvalidState(_)));

        manager.before_instance(&state).unwrap();
        let err = manager.after_instance(&state).unwrap_err();
        assert!(matches!(err, LifecyclerError::InvalidState(_)));

        manager.with_instance(&state).unwrap();
        let report = manager.after_instance(&state).unwrap();
        assert_eq!(report.completed, vec!["a"]);
    }

    #[test]
    fn close_after_failed_activation_is_safe() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(&dir);

        assert!(manager.activate_plugins(&["ghost"]).is_err());
        manager.close();
        assert!(manager.lifecyclers().is_empty());
    }
}
