//! Client-side proxy for one activated plugin

use std::time::Duration;

use serde::de::DeserializeOwned;

use super::contract::InstanceState;
use super::flags::{FlagValues, PluginFlag, PluginFlags};
use super::protocol::{ConfigQuery, Handshake, Operation, PluginRequest};
use super::transport::{Transport, TransportError};
use crate::error::{LifecyclerError, Result};

/// Typed access to a plugin's hooks
///
/// Application errors from the plugin come back as `HookFailed`; anything
/// wrong with the channel itself is a `CommunicationFailure`.
pub struct PluginHandle {
    plugin: String,
    transport: Box<dyn Transport>,
    call_timeout: Duration,
}

impl PluginHandle {
    /// Handshakes over `transport` and returns a live handle
    pub fn connect(
        mut transport: Box<dyn Transport>,
        hello: &Handshake,
        handshake_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self> {
        let plugin = hello.plugin.clone();
        let ready = match transport.handshake(hello, handshake_timeout) {
            Ok(ready) => ready,
            Err(e) => {
                let _ = transport.close();
                return Err(communication(&plugin, e));
            }
        };

        if ready.plugin != plugin {
            tracing::warn!(
                plugin = %plugin,
                acknowledged = %ready.plugin,
                "Plugin acknowledged the handshake under a different name"
            );
        }

        Ok(Self {
            plugin,
            transport,
            call_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.plugin
    }

    pub fn flags(&mut self) -> Result<PluginFlags> {
        let list: Vec<PluginFlag> = self.call_for(PluginRequest::Flags)?;
        PluginFlags::try_from(list)
    }

    pub fn environment(&mut self, version: &str, flags: &FlagValues) -> Result<Vec<String>> {
        self.call_for(PluginRequest::Environment(query(version, flags)))
    }

    pub fn volumes(&mut self, version: &str, flags: &FlagValues) -> Result<Vec<String>> {
        self.call_for(PluginRequest::Volumes(query(version, flags)))
    }

    pub fn ports(&mut self, version: &str, flags: &FlagValues) -> Result<Vec<String>> {
        self.call_for(PluginRequest::Ports(query(version, flags)))
    }

    pub fn before_instance(&mut self, state: &InstanceState) -> Result<()> {
        self.call(PluginRequest::BeforeInstance(state.clone()))
            .map(|_| ())
    }

    pub fn with_instance(&mut self, state: &InstanceState) -> Result<()> {
        self.call(PluginRequest::WithInstance(state.clone()))
            .map(|_| ())
    }

    pub fn after_instance(&mut self, state: &InstanceState) -> Result<()> {
        self.call(PluginRequest::AfterInstance(state.clone()))
            .map(|_| ())
    }

    /// Ends the session and, for a subprocess, reaps it
    pub fn close(&mut self) -> Result<()> {
        self.transport
            .close()
            .map_err(|e| communication(&self.plugin, e))
    }

    fn call(&mut self, request: PluginRequest) -> Result<Option<serde_json::Value>> {
        let operation = request.operation();
        tracing::trace!(plugin = %self.plugin, %operation, "Calling plugin");

        let response = self
            .transport
            .call(&request, self.call_timeout)
            .map_err(|e| communication(&self.plugin, e))?;

        if response.success {
            Ok(response.data)
        } else {
            Err(LifecyclerError::HookFailed {
                plugin: self.plugin.clone(),
                operation,
                message: response
                    .error
                    .unwrap_or_else(|| "Unknown error".to_string()),
            })
        }
    }

    fn call_for<T: DeserializeOwned>(&mut self, request: PluginRequest) -> Result<T> {
        let operation = request.operation();
        let data = self.call(request)?.ok_or_else(|| LifecyclerError::CommunicationFailure {
            plugin: self.plugin.clone(),
            reason: format!("no result returned from {}", operation),
        })?;

        serde_json::from_value(data).map_err(|e| LifecyclerError::CommunicationFailure {
            plugin: self.plugin.clone(),
            reason: format!("malformed {} result: {}", operation, e),
        })
    }
}

fn query(version: &str, flags: &FlagValues) -> ConfigQuery {
    ConfigQuery {
        version: version.to_string(),
        flags: flags.clone(),
    }
}

fn communication(plugin: &str, error: TransportError) -> LifecyclerError {
    LifecyclerError::CommunicationFailure {
        plugin: plugin.to_string(),
        reason: error.to_string(),
    }
}

/// Shorthand used in log fields
pub(crate) fn phase_label(operation: Operation) -> &'static str {
    match operation {
        Operation::BeforeInstance => "before",
        Operation::WithInstance => "with",
        Operation::AfterInstance => "after",
        _ => "query",
    }
}
