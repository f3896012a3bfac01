//! # Lifecycle Plugin System
//!
//! Extension points around the create/start sequence of an instance.
//!
//! ## Overview
//!
//! Lifecycle plugins are separate executables that talk to the host via JSON
//! over stdin/stdout. They are never linked into the host; a crashing plugin
//! takes down only its own process.
//!
//! ## Plugin Discovery
//!
//! | Source | Naming | Transport |
//! |--------|--------|-----------|
//! | Plugin directory | `iscenv-lifecycler-{name}` | [`StdioTransport`] |
//! | Built-in | registered on the manager | [`LocalTransport`] |
//!
//! ## Protocol
//!
//! ```text
//! Host                                     Plugin Binary
//!  │                                            │
//!  ├── Spawn: iscenv-lifecycler-csp --log-level info
//!  │                                            │
//!  ├── {"type":"handshake","protocol":1,"plugin":"csp",...}
//!  │◄── {"type":"ready","protocol":1,"plugin":"csp"}
//!  │                                            │
//!  ├── {"type":"call","request":{"operation":"flags"}}
//!  │◄── {"type":"response","success":true,"data":[...]}
//!  │                                            │
//!  └── stdin closed ─────────────────────────► exit
//! ```
//!
//! ## Hook Phases
//!
//! For each instance operation, all activated plugins are called in
//! activation order: `BeforeInstance`, then the container bring-up, then
//! `WithInstance`, then `AfterInstance`. The first two phases stop at the
//! first failure; `AfterInstance` failures are collected and reported.
//!
//! ## Key Types
//!
//! - [`Lifecycler`] - The contract a plugin implements
//! - [`serve`] - Runs a plugin over stdin/stdout
//! - [`LifecyclerManager`] - Activates plugins and drives the hooks
//! - [`PluginHandle`] - Typed proxy for one plugin
//! - [`PluginFlags`] - A plugin's declared options

mod contract;
mod flags;
mod handle;
mod hooks;
mod loader;
mod manager;
mod protocol;
mod server;
mod transport;

pub use contract::{InstanceState, Lifecycler};
pub use flags::{namespaced_flag, FlagValues, PluginFlag, PluginFlags};
pub use handle::PluginHandle;
pub use hooks::{AfterReport, OperationReport, StartOptions};
pub use loader::{PluginDescriptor, PluginLoader, PluginSource, PLUGIN_PREFIX};
pub use manager::{
    ActivatedLifecycler, ActivationPolicy, LifecyclerManager, ManagerConfig, PluginArgs,
};
pub use protocol::{
    ConfigQuery, Handshake, HostMessage, Operation, PluginMessage, PluginRequest, PluginResponse,
    Ready, PROTOCOL_VERSION,
};
pub use server::{dispatch, serve, serve_io, ServeArgs};
pub use transport::{LocalTransport, StdioTransport, Transport, TransportError};
