//! Channels between the host and one plugin
//!
//! [`StdioTransport`] talks to a child process over its stdin/stdout.
//! [`LocalTransport`] serves a built-in lifecycler in process through the same
//! dispatch path the plugin server uses.

use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::contract::Lifecycler;
use super::protocol::{
    Handshake, HostMessage, PluginMessage, PluginRequest, PluginResponse, Ready, PROTOCOL_VERSION,
};
use super::server;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error talking to plugin: {0}")]
    Io(#[from] io::Error),

    #[error("plugin closed its output")]
    Closed,

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("handshake rejected: {0}")]
    Rejected(String),

    #[error("transport unusable after an earlier failure")]
    Broken,
}

/// A request/response channel to one plugin
pub trait Transport {
    /// Opens the session; returns the plugin's acknowledgement
    fn handshake(&mut self, hello: &Handshake, timeout: Duration) -> Result<Ready, TransportError>;

    /// Sends one request and waits for its response
    fn call(
        &mut self,
        request: &PluginRequest,
        timeout: Duration,
    ) -> Result<PluginResponse, TransportError>;

    /// Ends the session. Calling it again is a no-op.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Transport over a spawned plugin's stdin/stdout
pub struct StdioTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<io::Result<String>>,
    shutdown_grace: Duration,
    broken: bool,
    closed: bool,
}

impl StdioTransport {
    /// Spawns `path` with `args` and extra environment `env`
    ///
    /// The child's stderr is inherited so its logs land next to the host's.
    pub fn spawn(
        path: &Path,
        args: &[String],
        env: &[(String, String)],
        shutdown_grace: Duration,
    ) -> io::Result<Self> {
        let mut child = Command::new(path)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "plugin stdout unavailable"))?;

        // The reader ends on its own once the child's stdout closes.
        let (tx, lines) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let failed = line.is_err();
                if tx.send(line).is_err() || failed {
                    break;
                }
            }
        });

        Ok(Self {
            child,
            stdin,
            lines,
            shutdown_grace,
            broken: false,
            closed: false,
        })
    }

    /// OS process id of the plugin
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    fn send(&mut self, message: &HostMessage) -> Result<(), TransportError> {
        let stdin = self.stdin.as_mut().ok_or(TransportError::Closed)?;
        let line = serde_json::to_string(message)
            .map_err(|e| TransportError::Protocol(format!("failed to encode request: {}", e)))?;
        writeln!(stdin, "{}", line)?;
        stdin.flush()?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<PluginMessage, TransportError> {
        let line = match self.lines.recv_timeout(timeout) {
            Ok(line) => line?,
            Err(RecvTimeoutError::Timeout) => return Err(TransportError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed),
        };

        serde_json::from_str(&line)
            .map_err(|e| TransportError::Protocol(format!("unreadable reply {:?}: {}", line, e)))
    }

    /// Runs one send/receive exchange, poisoning the transport on failure
    fn exchange(
        &mut self,
        message: &HostMessage,
        timeout: Duration,
    ) -> Result<PluginMessage, TransportError> {
        if self.broken || self.closed {
            return Err(TransportError::Broken);
        }

        let result = self.send(message).and_then(|_| self.receive(timeout));
        if result.is_err() {
            // A plugin that missed a reply is in an unknown state.
            self.broken = true;
            self.kill();
        }
        result
    }

    fn kill(&mut self) {
        self.stdin = None;
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }

    fn wait_for_exit(&mut self, grace: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

impl Transport for StdioTransport {
    fn handshake(&mut self, hello: &Handshake, timeout: Duration) -> Result<Ready, TransportError> {
        match self.exchange(&HostMessage::Handshake(hello.clone()), timeout)? {
            PluginMessage::Ready(ready) if ready.protocol == PROTOCOL_VERSION => Ok(ready),
            PluginMessage::Ready(ready) => {
                self.broken = true;
                self.kill();
                Err(TransportError::Protocol(format!(
                    "plugin speaks protocol {}, host speaks {}",
                    ready.protocol, PROTOCOL_VERSION
                )))
            }
            PluginMessage::Rejected { reason } => {
                self.broken = true;
                self.kill();
                Err(TransportError::Rejected(reason))
            }
            PluginMessage::Response(_) => {
                self.broken = true;
                self.kill();
                Err(TransportError::Protocol(
                    "response received before handshake acknowledgement".to_string(),
                ))
            }
        }
    }

    fn call(
        &mut self,
        request: &PluginRequest,
        timeout: Duration,
    ) -> Result<PluginResponse, TransportError> {
        let message = HostMessage::Call {
            request: request.clone(),
        };
        match self.exchange(&message, timeout)? {
            PluginMessage::Response(response) => Ok(response),
            other => {
                self.broken = true;
                self.kill();
                Err(TransportError::Protocol(format!(
                    "expected a response, got {:?}",
                    other
                )))
            }
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.broken {
            self.kill();
            return Ok(());
        }

        // EOF on stdin asks the plugin to exit.
        self.stdin = None;
        match self.wait_for_exit(self.shutdown_grace)? {
            Some(status) if !status.success() => {
                tracing::debug!(pid = self.child.id(), %status, "Plugin exited with failure status");
            }
            Some(_) => {}
            None => {
                tracing::warn!(
                    pid = self.child.id(),
                    grace = ?self.shutdown_grace,
                    "Plugin did not exit after its input closed; killing it"
                );
                self.kill();
            }
        }
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// In-process transport for built-in lifecyclers
pub struct LocalTransport {
    plugin: Box<dyn Lifecycler>,
    closed: bool,
}

impl LocalTransport {
    pub fn new(plugin: Box<dyn Lifecycler>) -> Self {
        Self {
            plugin,
            closed: false,
        }
    }
}

impl Transport for LocalTransport {
    fn handshake(&mut self, hello: &Handshake, _timeout: Duration) -> Result<Ready, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(Ready {
            protocol: PROTOCOL_VERSION,
            plugin: hello.plugin.clone(),
        })
    }

    fn call(
        &mut self,
        request: &PluginRequest,
        _timeout: Duration,
    ) -> Result<PluginResponse, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(server::dispatch(self.plugin.as_ref(), request.clone()))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogLevel;
    use crate::plugin::contract::InstanceState;
    use crate::plugin::flags::{FlagValues, PluginFlags};

    struct Quiet;

    impl Lifecycler for Quiet {
        fn flags(&self) -> anyhow::Result<PluginFlags> {
            Ok(PluginFlags::new())
        }
        fn environment(&self, _: &str, _: &FlagValues) -> anyhow::Result<Vec<String>> {
            Ok(vec!["QUIET=1".to_string()])
        }
        fn volumes(&self, _: &str, _: &FlagValues) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
        fn ports(&self, _: &str, _: &FlagValues) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
        fn before_instance(&self, _: &InstanceState) -> anyhow::Result<()> {
            Ok(())
        }
        fn with_instance(&self, _: &InstanceState) -> anyhow::Result<()> {
            Ok(())
        }
        fn after_instance(&self, _: &InstanceState) -> anyhow::Result<()> {
            anyhow::bail!("after failed")
        }
    }

    fn hello() -> Handshake {
        Handshake {
            protocol: PROTOCOL_VERSION,
            plugin: "quiet".to_string(),
            log_level: LogLevel::Info,
            log_json: false,
        }
    }

    #[test]
    fn local_transport_dispatches() {
        let mut transport = LocalTransport::new(Box::new(Quiet));
        let timeout = Duration::from_secs(1);

        let ready = transport.handshake(&hello(), timeout).unwrap();
        assert_eq!(ready.plugin, "quiet");

        let response = transport
            .call(
                &PluginRequest::AfterInstance(InstanceState::new("dev", "1")),
                timeout,
            )
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("after failed"));
    }

    #[test]
    fn local_transport_refuses_calls_after_close() {
        let mut transport = LocalTransport::new(Box::new(Quiet));
        transport.close().unwrap();
        transport.close().unwrap();

        let err = transport
            .call(&PluginRequest::Flags, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[cfg(unix)]
    #[test]
    fn stdio_transport_reports_early_exit_as_closed() {
        let mut transport = StdioTransport::spawn(
            Path::new("/bin/sh"),
            &["-c".to_string(), "exit 0".to_string()],
            &[],
            Duration::from_millis(200),
        )
        .unwrap();

        let err = transport
            .handshake(&hello(), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed | TransportError::Io(_)));

        let again = transport
            .call(&PluginRequest::Flags, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(again, TransportError::Broken));
    }

    #[cfg(unix)]
    #[test]
    fn stdio_transport_times_out_on_silent_plugin() {
        let mut transport = StdioTransport::spawn(
            Path::new("/bin/sh"),
            &["-c".to_string(), "exec sleep 30".to_string()],
            &[],
            Duration::from_millis(200),
        )
        .unwrap();

        let started = Instant::now();
        let err = transport
            .handshake(&hello(), Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));

        transport.close().unwrap();
    }
}
