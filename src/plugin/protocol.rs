//! Plugin protocol types
//!
//! Host and plugin exchange newline-delimited JSON over the plugin's
//! stdin/stdout. The host opens with a handshake, then issues one call at a
//! time and waits for its response.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::contract::InstanceState;
use super::flags::FlagValues;
use crate::logging::LogLevel;

/// Version of the fixed host/plugin contract; both sides must agree exactly
pub const PROTOCOL_VERSION: u32 = 1;

/// The contract's operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Flags,
    Environment,
    Volumes,
    Ports,
    BeforeInstance,
    WithInstance,
    AfterInstance,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Flags => "Flags",
            Operation::Environment => "Environment",
            Operation::Volumes => "Volumes",
            Operation::Ports => "Ports",
            Operation::BeforeInstance => "BeforeInstance",
            Operation::WithInstance => "WithInstance",
            Operation::AfterInstance => "AfterInstance",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First message from the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol: u32,

    /// Name the host activated the plugin under
    pub plugin: String,

    pub log_level: LogLevel,

    pub log_json: bool,
}

/// Plugin's acknowledgement of the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    pub protocol: u32,
    pub plugin: String,
}

/// Parameters of the Environment/Volumes/Ports queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigQuery {
    pub version: String,

    #[serde(default)]
    pub flags: FlagValues,
}

/// A call to one contract operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "params", rename_all = "snake_case")]
pub enum PluginRequest {
    Flags,
    Environment(ConfigQuery),
    Volumes(ConfigQuery),
    Ports(ConfigQuery),
    BeforeInstance(InstanceState),
    WithInstance(InstanceState),
    AfterInstance(InstanceState),
}

impl PluginRequest {
    pub fn operation(&self) -> Operation {
        match self {
            PluginRequest::Flags => Operation::Flags,
            PluginRequest::Environment(_) => Operation::Environment,
            PluginRequest::Volumes(_) => Operation::Volumes,
            PluginRequest::Ports(_) => Operation::Ports,
            PluginRequest::BeforeInstance(_) => Operation::BeforeInstance,
            PluginRequest::WithInstance(_) => Operation::WithInstance,
            PluginRequest::AfterInstance(_) => Operation::AfterInstance,
        }
    }
}

/// A response from a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginResponse {
    /// Whether the operation succeeded
    pub success: bool,

    /// Result data (if success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Error message (if failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PluginResponse {
    pub fn success(data: impl Into<serde_json::Value>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            error: None,
        }
    }

    pub fn done() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Messages the host writes to a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Handshake(Handshake),
    Call { request: PluginRequest },
}

/// Messages a plugin writes to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginMessage {
    Ready(Ready),
    Rejected { reason: String },
    Response(PluginResponse),
}
