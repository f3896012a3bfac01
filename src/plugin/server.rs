//! Plugin side of the protocol
//!
//! A plugin binary's `main` is typically just:
//!
//! ```no_run
//! # use iscenv_plugins::plugin::{serve, Lifecycler};
//! # fn plugin() -> Box<dyn Lifecycler> { unimplemented!() }
//! fn main() -> anyhow::Result<()> {
//!     serve(plugin().as_ref())
//! }
//! ```

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use clap::Parser;

use super::contract::Lifecycler;
use super::protocol::{
    ConfigQuery, Handshake, HostMessage, PluginMessage, PluginRequest, PluginResponse, Ready,
    PROTOCOL_VERSION,
};
use crate::logging::{self, LogLevel};

/// Arguments the host passes when it spawns a plugin
#[derive(Debug, Clone, Parser)]
#[command(about = "iscenv lifecycle plugin; run by the iscenv host")]
pub struct ServeArgs {
    /// Log severity
    #[arg(long, default_value = "info")]
    pub log_level: LogLevel,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

impl ServeArgs {
    /// Command-line form, as the host passes it
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["--log-level".to_string(), self.log_level.to_string()];
        if self.log_json {
            args.push("--log-json".to_string());
        }
        args
    }
}

/// Serves `plugin` over stdin/stdout until the host closes stdin
pub fn serve(plugin: &dyn Lifecycler) -> Result<()> {
    let args = ServeArgs::parse();
    logging::init(args.log_level, args.log_json)?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    serve_io(plugin, stdin.lock(), stdout.lock())
}

/// Serves `plugin` over arbitrary streams
///
/// Expects a handshake first, then answers calls in order. Returns once
/// `input` reaches EOF.
pub fn serve_io<R: BufRead, W: Write>(plugin: &dyn Lifecycler, input: R, mut output: W) -> Result<()> {
    let mut lines = input.lines();

    let hello = match lines.next() {
        Some(line) => line.context("Failed to read handshake")?,
        None => return Ok(()),
    };
    let name = match accept_handshake(&hello) {
        Ok(hello) => {
            let ready = PluginMessage::Ready(Ready {
                protocol: PROTOCOL_VERSION,
                plugin: hello.plugin.clone(),
            });
            write_message(&mut output, &ready)?;
            hello.plugin
        }
        Err(reason) => {
            tracing::error!(%reason, "Rejecting handshake");
            write_message(&mut output, &PluginMessage::Rejected { reason: reason.clone() })?;
            anyhow::bail!("Handshake rejected: {}", reason);
        }
    };

    tracing::debug!(plugin = %name, "Plugin ready");

    for line in lines {
        let line = line.context("Failed to read request")?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<HostMessage>(&line) {
            Ok(HostMessage::Call { request }) => {
                let operation = request.operation();
                tracing::debug!(plugin = %name, %operation, "Serving call");
                dispatch(plugin, request)
            }
            Ok(HostMessage::Handshake(_)) => PluginResponse::error("Handshake already completed"),
            Err(e) => PluginResponse::error(format!("Malformed request: {}", e)),
        };

        write_message(&mut output, &PluginMessage::Response(response))?;
    }

    tracing::debug!(plugin = %name, "Host closed input; shutting down");
    Ok(())
}

fn accept_handshake(line: &str) -> std::result::Result<Handshake, String> {
    match serde_json::from_str::<HostMessage>(line) {
        Ok(HostMessage::Handshake(hello)) if hello.protocol == PROTOCOL_VERSION => Ok(hello),
        Ok(HostMessage::Handshake(hello)) => Err(format!(
            "host speaks protocol {}, plugin speaks {}",
            hello.protocol, PROTOCOL_VERSION
        )),
        Ok(HostMessage::Call { .. }) => Err("call received before handshake".to_string()),
        Err(e) => Err(format!("unreadable handshake: {}", e)),
    }
}

fn write_message<W: Write>(output: &mut W, message: &PluginMessage) -> Result<()> {
    let line = serde_json::to_string(message).context("Failed to serialize response")?;
    writeln!(output, "{}", line).context("Failed to write to host")?;
    output.flush().context("Failed to flush output")
}

/// Runs one request against `plugin`
///
/// Errors returned by the plugin become failed responses; they never tear
/// down the session.
pub fn dispatch(plugin: &dyn Lifecycler, request: PluginRequest) -> PluginResponse {
    let result = match request {
        PluginRequest::Flags => plugin.flags().and_then(|flags| to_data(&flags)),
        PluginRequest::Environment(ConfigQuery { version, flags }) => plugin
            .environment(&version, &flags)
            .and_then(|env| to_data(&env)),
        PluginRequest::Volumes(ConfigQuery { version, flags }) => plugin
            .volumes(&version, &flags)
            .and_then(|volumes| to_data(&volumes)),
        PluginRequest::Ports(ConfigQuery { version, flags }) => plugin
            .ports(&version, &flags)
            .and_then(|ports| to_data(&ports)),
        PluginRequest::BeforeInstance(state) => plugin.before_instance(&state).map(|_| None),
        PluginRequest::WithInstance(state) => plugin.with_instance(&state).map(|_| None),
        PluginRequest::AfterInstance(state) => plugin.after_instance(&state).map(|_| None),
    };

    match result {
        Ok(Some(data)) => PluginResponse::success(data),
        Ok(None) => PluginResponse::done(),
        Err(e) => PluginResponse::error(format!("{:#}", e)),
    }
}

fn to_data<T: serde::Serialize>(value: &T) -> Result<Option<serde_json::Value>> {
    serde_json::to_value(value)
        .map(Some)
        .context("Failed to serialize result")
}
