//! iscenv plugins - lifecycle extension points for ISC product containers
//!
//! Third parties ship standalone executables that hook into the
//! create/start sequence of a managed instance. This crate discovers,
//! activates, configures and invokes them through a fixed contract.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod plugin;

pub use error::{LifecyclerError, Result};
pub use plugin::{InstanceState, Lifecycler, LifecyclerManager, ManagerConfig};
