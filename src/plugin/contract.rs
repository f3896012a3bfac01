//! The fixed contract every lifecycle plugin answers

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::flags::{FlagValues, PluginFlags};

/// Read-only view of the instance under operation
///
/// Each plugin receives its own copy, with `flags` holding only that
/// plugin's resolved values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Instance name, without the container prefix
    pub name: String,

    /// Product version (image tag)
    pub version: String,

    /// Container id, once the container exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Resolved flag values for the plugin being called
    #[serde(default)]
    pub flags: FlagValues,
}

impl InstanceState {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            id: None,
            flags: FlagValues::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Copy of this state carrying one plugin's flag values
    pub fn scoped(&self, flags: &FlagValues) -> Self {
        Self {
            flags: flags.clone(),
            ..self.clone()
        }
    }
}

/// A lifecycle plugin
///
/// Implement this and hand it to [`serve`](super::serve) from the plugin's
/// `main`. Calls arrive one at a time and must return promptly; the host
/// gives up on a call after its configured timeout and kills the process.
pub trait Lifecycler {
    /// Declares the plugin's options. Called once, before any instance event.
    fn flags(&self) -> Result<PluginFlags>;

    /// Container environment variables, as `KEY=VALUE`
    fn environment(&self, version: &str, flags: &FlagValues) -> Result<Vec<String>>;

    /// Volume specs (`host:container[:mode]` or a bare container path)
    fn volumes(&self, version: &str, flags: &FlagValues) -> Result<Vec<String>>;

    /// Port mappings (`[ip:]host:container`)
    fn ports(&self, version: &str, flags: &FlagValues) -> Result<Vec<String>>;

    /// Runs before the instance exists; an error aborts provisioning
    fn before_instance(&self, state: &InstanceState) -> Result<()>;

    /// Runs while the instance is brought up
    fn with_instance(&self, state: &InstanceState) -> Result<()>;

    /// Runs once the instance reached its target state
    fn after_instance(&self, state: &InstanceState) -> Result<()>;
}
