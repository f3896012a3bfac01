//! Plugin discovery
//!
//! Lifecycle plugins are executables named `iscenv-lifecycler-{name}` in the
//! configured plugin directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::LifecyclerError;

/// File name prefix shared by every lifecycle plugin executable
pub const PLUGIN_PREFIX: &str = "iscenv-lifecycler-";

/// Where a plugin's implementation lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    /// Standalone executable, run as a subprocess
    Executable(PathBuf),

    /// Registered in process by the host
    Builtin,
}

/// A resolved plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    /// Plugin name (e.g., "csp")
    pub name: String,

    pub source: PluginSource,
}

impl PluginDescriptor {
    pub fn executable_path(&self) -> Option<&Path> {
        match &self.source {
            PluginSource::Executable(path) => Some(path),
            PluginSource::Builtin => None,
        }
    }
}

/// Finds plugin executables in one directory
#[derive(Debug, Clone)]
pub struct PluginLoader {
    plugin_dir: PathBuf,
}

impl PluginLoader {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
        }
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Path the executable for `name` is expected at
    pub fn executable_path(&self, name: &str) -> PathBuf {
        self.plugin_dir.join(format!(
            "{}{}{}",
            PLUGIN_PREFIX,
            name,
            std::env::consts::EXE_SUFFIX
        ))
    }

    /// Resolves a plugin name to its executable
    pub fn resolve(&self, name: &str) -> Result<PluginDescriptor, LifecyclerError> {
        let path = self.executable_path(name);

        let valid_name = !name.is_empty()
            && !name.contains(['/', '\\'])
            && name != "."
            && name != "..";
        if !valid_name || !path.is_file() || !is_executable(&path) {
            return Err(LifecyclerError::PluginNotFound {
                name: name.to_string(),
                path,
            });
        }

        Ok(PluginDescriptor {
            name: name.to_string(),
            source: PluginSource::Executable(path),
        })
    }

    /// Lists every plugin executable in the plugin directory, by name
    pub fn discover(&self) -> Result<Vec<PluginDescriptor>> {
        let mut found = BTreeMap::new();

        if !self.plugin_dir.is_dir() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&self.plugin_dir).with_context(|| {
            format!(
                "Failed to read plugin directory: {}",
                self.plugin_dir.display()
            )
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let stem = file_name
                .strip_suffix(std::env::consts::EXE_SUFFIX)
                .unwrap_or(file_name);

            if let Some(name) = stem.strip_prefix(PLUGIN_PREFIX) {
                if !name.is_empty() && path.is_file() && is_executable(&path) {
                    found.insert(
                        name.to_string(),
                        PluginDescriptor {
                            name: name.to_string(),
                            source: PluginSource::Executable(path.clone()),
                        },
                    );
                }
            }
        }

        Ok(found.into_values().collect())
    }
}

/// Checks if a file is executable
fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = path.metadata() {
            return meta.permissions().mode() & 0o111 != 0;
        }
    }

    #[cfg(windows)]
    {
        if let Some(ext) = path.extension() {
            return ext == "exe" || ext == "bat" || ext == "cmd";
        }
    }

    false
}
