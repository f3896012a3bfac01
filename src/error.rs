//! Error types for the lifecycle plugin framework

use std::path::PathBuf;

use thiserror::Error;

use crate::plugin::Operation;

pub type Result<T, E = LifecyclerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum LifecyclerError {
    #[error("Plugin not found: {name} (looked for {})", .path.display())]
    PluginNotFound { name: String, path: PathBuf },

    #[error("Failed to activate plugin {plugin}")]
    ActivationFailed {
        plugin: String,
        #[source]
        source: Box<LifecyclerError>,
    },

    #[error("Flag already exists, flag: {flag}")]
    FlagCollision { flag: String },

    #[error("Lost communication with plugin {plugin}: {reason}")]
    CommunicationFailure { plugin: String, reason: String },

    #[error("Plugin {plugin} failed in {operation}: {message}")]
    HookFailed {
        plugin: String,
        operation: Operation,
        message: String,
    },

    #[error("Failed to spawn plugin executable {}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Lifecycler manager misuse: {0}")]
    InvalidState(&'static str),

    #[error("Instance bring-up failed")]
    BringUp(#[source] anyhow::Error),

    #[error("{} plugin(s) failed in AfterInstance: {}", .0.len(), join_errors(.0))]
    AfterPhase(Vec<LifecyclerError>),
}

impl LifecyclerError {
    pub(crate) fn activation(plugin: &str, source: LifecyclerError) -> Self {
        Self::ActivationFailed {
            plugin: plugin.to_string(),
            source: Box::new(source),
        }
    }

    /// True for failures that leave the plugin process in an unknown state
    pub fn is_communication_failure(&self) -> bool {
        matches!(self, Self::CommunicationFailure { .. })
    }
}

fn join_errors(errors: &[LifecyclerError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
