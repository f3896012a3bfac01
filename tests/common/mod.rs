//! Shared fixtures: a plugin directory populated with copies of the
//! example plugin under different names.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use iscenv_plugins::plugin::{ManagerConfig, PLUGIN_PREFIX};
use iscenv_plugins::LifecyclerManager;
use tempfile::TempDir;

pub const RECORD_ENV: &str = "ISCENV_EXAMPLE_RECORD";

pub struct PluginDir {
    dir: TempDir,
    record: PathBuf,
}

impl PluginDir {
    pub fn new() -> Self {
        // Same filesystem as the built binary so installs can hard link
        let dir = TempDir::new_in(env!("CARGO_TARGET_TMPDIR")).unwrap();
        let record = dir.path().join("record.log");
        Self { dir, record }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn record_path(&self) -> &Path {
        &self.record
    }

    /// Installs the example plugin as `name`
    pub fn install(&self, name: &str) -> PathBuf {
        let source = Path::new(env!("CARGO_BIN_EXE_iscenv-lifecycler-example"));
        let target = self.dir.path().join(format!(
            "{}{}{}",
            PLUGIN_PREFIX,
            name,
            std::env::consts::EXE_SUFFIX
        ));

        // A freshly written executable can fail to spawn with ETXTBSY while
        // other test threads fork; a hard link never holds a write handle.
        if fs::hard_link(source, &target).is_err() {
            fs::copy(source, &target).unwrap();
        }
        target
    }

    /// Writes an executable shell script as plugin `name`
    #[cfg(unix)]
    pub fn install_script(&self, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let target = self.dir.path().join(format!("{}{}", PLUGIN_PREFIX, name));
        fs::write(&target, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755)).unwrap();
        target
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let mut config = ManagerConfig::new(self.dir.path());
        config.call_timeout = Duration::from_secs(20);
        config.handshake_timeout = Duration::from_secs(20);
        config.shutdown_grace = Duration::from_secs(5);
        config.env = vec![(
            RECORD_ENV.to_string(),
            self.record.display().to_string(),
        )];
        config
    }

    pub fn manager(&self) -> LifecyclerManager {
        LifecyclerManager::new(self.manager_config())
    }

    /// Lines the example plugins appended so far
    pub fn recorded(&self) -> Vec<String> {
        fs::read_to_string(&self.record)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}
