// src/communication/monitor.rs - External emulator process and monitor socket
//
// The child process and the monitor connection are owned together: `start` acquires them,
// `stop` releases both on every path, and `kill_on_drop` covers a channel that is dropped
// without being stopped.

use crate::communication::response::{self, PromptAfterEcho, ResponseMatcher};
use crate::config::EmulatorConfig;
use std::io;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BINARY: &str = "qemu-system-arm";
pub const QUIT_COMMAND: &str = "quit";

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to spawn emulator '{binary}': {source}")]
    SpawnFailed {
        binary: String,
        #[source]
        source: io::Error,
    },
    #[error("could not connect to the monitor on port {port}: {source}")]
    MonitorConnectFailed {
        port: u16,
        #[source]
        source: Box<MonitorError>,
    },
    #[error("monitor connection refused on port {0}")]
    ConnectionRefused(u16),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("monitor closed the connection")]
    ConnectionClosed,
    #[error("monitor connection reset: {0}")]
    ConnectionReset(#[source] io::Error),
    #[error("monitor write failed: {0}")]
    WriteError(#[source] io::Error),
    #[error("monitor read failed: {0}")]
    ReadError(#[source] io::Error),
    #[error("wait for monitor response cancelled")]
    Cancelled,
    #[error("unexpected monitor response: {0}")]
    UnexpectedResponse(String),
    #[error("emulator does not support {0}")]
    Unsupported(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn classify_read_error(e: io::Error) -> MonitorError {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => MonitorError::ConnectionReset(e),
        _ => MonitorError::ReadError(e),
    }
}

/// Owns one emulator process and its monitor connection.
///
/// Like the rest of the crate this is single-owner: wrap it in a `tokio::sync::Mutex` if
/// several tasks need it. No two channels may share a monitor port.
#[derive(Debug)]
pub struct MonitorChannel {
    config: EmulatorConfig,
    child: Option<Child>,
    stream: Option<TcpStream>,
    /// Bytes received after the end of the last matched response.
    pending: Vec<u8>,
    running: bool,
    cancel: CancellationToken,
}

/// Sends SIGTERM so the emulator can shut down on its own terms. Returns whether the
/// signal was delivered.
#[cfg(unix)]
fn terminate(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // SAFETY: `pid` belongs to a child we spawned and have not reaped yet.
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) -> bool {
    false
}

async fn wait_exit(child: &mut Child, grace: Duration) -> bool {
    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!("Emulator exited: {}", status);
            true
        }
        Ok(Err(e)) => {
            tracing::warn!("Failed to wait for emulator: {}", e);
            false
        }
        Err(_) => false,
    }
}

impl MonitorChannel {
    pub fn new(config: EmulatorConfig) -> Self {
        Self {
            config,
            child: None,
            stream: None,
            pending: Vec::new(),
            running: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Token consulted by every wait on the monitor socket.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn binary(&self) -> &str {
        self.config.binary.as_deref().unwrap_or(DEFAULT_BINARY)
    }

    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            "-machine".to_string(),
            self.config.machine_type.clone(),
            "-cpu".to_string(),
            self.config.cpu_type.clone(),
            "-m".to_string(),
            self.config.memory_mb.to_string(),
            "-nographic".to_string(),
            "-monitor".to_string(),
            format!("tcp:127.0.0.1:{},server,nowait", self.config.monitor_port),
        ];
        if let Some(kernel) = &self.config.kernel {
            args.push("-kernel".to_string());
            args.push(kernel.clone());
        }
        args
    }

    // --- Lifecycle ---

    pub async fn start(&mut self) -> Result<(), MonitorError> {
        if self.running {
            tracing::debug!("Emulator already running");
            return Ok(());
        }

        let binary = self.binary().to_string();
        let args = self.command_args();
        tracing::info!("Starting emulator: {} {}", binary, args.join(" "));

        let child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MonitorError::SpawnFailed {
                binary: binary.clone(),
                source,
            })?;
        self.child = Some(child);

        sleep(Duration::from_millis(self.config.settle_delay_ms)).await;

        // An emulator that died while settling is not stood in for by whatever else
        // listens on the monitor port.
        if let Some(child) = self.child.as_mut() {
            let exited = match child.try_wait() {
                Ok(Some(status)) => Some(io::Error::other(format!(
                    "emulator exited during startup ({})",
                    status
                ))),
                Ok(None) => None,
                Err(e) => Some(e),
            };
            if let Some(source) = exited {
                tracing::error!("Emulator did not come up: {}", source);
                self.stop().await;
                return Err(MonitorError::SpawnFailed { binary, source });
            }
        }

        if self.config.enable_monitor {
            if let Err(e) = self.connect_monitor().await {
                tracing::error!("Failed to connect to emulator monitor: {}", e);
                self.stop().await;
                return Err(MonitorError::MonitorConnectFailed {
                    port: self.config.monitor_port,
                    source: Box::new(e),
                });
            }
        }

        self.running = true;
        tracing::info!("Emulator started with PID {:?}", self.pid());
        Ok(())
    }

    /// Best-effort teardown. Always leaves the channel stopped and reusable; failures are
    /// logged, never returned.
    pub async fn stop(&mut self) {
        let mut quit_sent = false;
        if let Some(mut stream) = self.stream.take() {
            match stream.write_all(format!("{}\n", QUIT_COMMAND).as_bytes()).await {
                Ok(()) => quit_sent = true,
                Err(e) => tracing::warn!("Failed to send quit to monitor: {}", e),
            }
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("Monitor socket shutdown: {}", e);
            }
        }

        self.pending.clear();

        // quit, then SIGTERM, then SIGKILL, each given the grace period
        if let Some(mut child) = self.child.take() {
            let grace = Duration::from_millis(self.config.shutdown_grace_ms);
            let mut exited = quit_sent && wait_exit(&mut child, grace).await;
            if !exited && terminate(&child) {
                tracing::debug!("Sent SIGTERM to emulator");
                exited = wait_exit(&mut child, grace).await;
            }
            if !exited {
                if let Err(e) = child.kill().await {
                    tracing::warn!("Failed to kill emulator: {}", e);
                }
            }
        }

        self.running = false;
        tracing::info!("Emulator stopped");
    }

    pub async fn restart(&mut self) -> Result<(), MonitorError> {
        tracing::info!("Restarting emulator");
        self.stop().await;
        sleep(Duration::from_millis(self.config.restart_delay_ms)).await;
        self.start().await
    }

    pub async fn connect_monitor(&mut self) -> Result<(), MonitorError> {
        let port = self.config.monitor_port;
        let limit = Duration::from_millis(self.config.connect_timeout_ms);

        let stream = match timeout(limit, TcpStream::connect((Ipv4Addr::LOCALHOST, port))).await {
            Err(_) => return Err(MonitorError::Timeout(limit)),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(MonitorError::ConnectionRefused(port));
            }
            Ok(Err(e)) => return Err(MonitorError::Io(e)),
            Ok(Ok(stream)) => stream,
        };
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.pending.clear();

        tracing::info!("Connected to emulator monitor on port {}", port);
        Ok(())
    }

    // --- Command channel ---

    /// Writes `command` followed by exactly one newline.
    pub async fn send(&mut self, command: &str) -> Result<(), MonitorError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| MonitorError::WriteError(io::ErrorKind::NotConnected.into()))?;

        let mut line = command.trim_end_matches(['\r', '\n']).to_string();
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(MonitorError::WriteError)?;
        stream.flush().await.map_err(MonitorError::WriteError)?;

        tracing::debug!("Monitor <- {}", line.trim_end());
        Ok(())
    }

    /// One read bounded by the configured read timeout. `Ok(0)` means the peer closed.
    /// Bytes left over from an earlier match are returned first.
    pub async fn read(&mut self, buffer: &mut [u8]) -> Result<usize, MonitorError> {
        if !self.pending.is_empty() {
            let n = buffer.len().min(self.pending.len());
            buffer[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }

        let limit = Duration::from_millis(self.config.read_timeout_ms);
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| MonitorError::ReadError(io::ErrorKind::NotConnected.into()))?;

        match timeout(limit, stream.read(buffer)).await {
            Err(_) => Err(MonitorError::Timeout(limit)),
            Ok(Err(e)) => Err(classify_read_error(e)),
            Ok(Ok(n)) => Ok(n),
        }
    }

    /// Waits until `expected` appears in the received text. Returns the number of bytes
    /// accumulated when it did.
    pub async fn wait_for(&mut self, expected: &str, limit: Duration) -> Result<usize, MonitorError> {
        self.wait_for_match(expected, limit).await
    }

    pub async fn wait_for_match<M>(&mut self, matcher: &M, limit: Duration) -> Result<usize, MonitorError>
    where
        M: ResponseMatcher + ?Sized,
    {
        Ok(self.collect_until(matcher, limit).await?.len())
    }

    async fn collect_until<M>(&mut self, matcher: &M, limit: Duration) -> Result<Vec<u8>, MonitorError>
    where
        M: ResponseMatcher + ?Sized,
    {
        let capacity = self.config.response_buffer_size.max(1);
        let cancel = self.cancel.clone();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| MonitorError::ReadError(io::ErrorKind::NotConnected.into()))?;

        let deadline = Instant::now() + limit;
        let mut received = std::mem::take(&mut self.pending);
        received.reserve(capacity.saturating_sub(received.len()));
        if let Some(end) = matcher.match_end(&received) {
            self.pending = received.split_off(end);
            return Ok(received);
        }
        let mut chunk = vec![0u8; capacity];

        // A wait that gives up early keeps what arrived for the next one.
        while received.len() < capacity {
            if cancel.is_cancelled() {
                self.pending = received;
                return Err(MonitorError::Cancelled);
            }
            let room = capacity - received.len();
            let read = tokio::select! {
                _ = cancel.cancelled() => None,
                read = timeout_at(deadline, stream.read(&mut chunk[..room])) => Some(read),
            };
            let Some(read) = read else {
                self.pending = received;
                return Err(MonitorError::Cancelled);
            };
            let n = match read {
                Err(_) => {
                    self.pending = received;
                    return Err(MonitorError::Timeout(limit));
                }
                Ok(Err(e)) => return Err(classify_read_error(e)),
                Ok(Ok(0)) => return Err(MonitorError::ConnectionClosed),
                Ok(Ok(n)) => n,
            };
            received.extend_from_slice(&chunk[..n]);
            tracing::trace!("Monitor -> {} bytes ({} buffered)", n, received.len());

            if let Some(end) = matcher.match_end(&received) {
                self.pending = received.split_off(end);
                return Ok(received);
            }
        }

        tracing::warn!("Monitor response buffer filled without a match");
        Err(MonitorError::Timeout(limit))
    }

    /// Sends `command` and returns the text the monitor printed before its next prompt.
    pub async fn query(&mut self, command: &str, limit: Duration) -> Result<String, MonitorError> {
        self.send(command).await?;
        let matcher = PromptAfterEcho { command };
        let received = self.collect_until(&matcher, limit).await?;
        response::extract_reply(&received, command)
            .ok_or_else(|| MonitorError::UnexpectedResponse(String::from_utf8_lossy(&received).into()))
    }

    fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.config.read_timeout_ms)
    }

    // --- Monitor queries ---

    pub async fn cpu_state(&mut self) -> Result<String, MonitorError> {
        let limit = self.query_timeout();
        self.query("info registers", limit).await
    }

    /// Raw dump text for `length` bytes at `address`; the dump itself is not parsed.
    pub async fn memory_region(&mut self, address: u32, length: usize) -> Result<String, MonitorError> {
        let limit = self.query_timeout();
        self.query(&format!("x/{}xb 0x{:08x}", length, address), limit).await
    }

    pub async fn set_breakpoint(&mut self, address: u32) -> Result<(), MonitorError> {
        let limit = self.query_timeout();
        self.query(&format!("break 0x{:08x}", address), limit).await?;
        tracing::debug!("Emulator breakpoint set at 0x{:08x}", address);
        Ok(())
    }

    pub async fn remove_breakpoint(&mut self, address: u32) -> Result<(), MonitorError> {
        let limit = self.query_timeout();
        self.query(&format!("del 0x{:08x}", address), limit).await?;
        tracing::debug!("Emulator breakpoint removed at 0x{:08x}", address);
        Ok(())
    }

    pub async fn read_word(&mut self, address: u32) -> Result<u32, MonitorError> {
        let command = response::render_command(&self.config.read_word_command, address, None);
        let limit = self.query_timeout();
        let reply = self.query(&command, limit).await?;
        response::parse_word(&reply).ok_or(MonitorError::UnexpectedResponse(reply))
    }

    pub async fn write_word(&mut self, address: u32, value: u32) -> Result<(), MonitorError> {
        let template = self
            .config
            .write_word_command
            .as_deref()
            .ok_or(MonitorError::Unsupported("register writes"))?;
        let command = response::render_command(template, address, Some(value));
        let limit = self.query_timeout();
        self.query(&command, limit).await?;
        Ok(())
    }

    // --- Installation probing ---

    /// First line of `<binary> --version`.
    pub async fn installed_version(&self) -> Result<String, MonitorError> {
        let binary = self.binary().to_string();
        let output = Command::new(&binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| MonitorError::SpawnFailed { binary, source })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.lines().next().map(str::trim) {
            Some(line) if !line.is_empty() => Ok(line.to_string()),
            _ => Err(MonitorError::UnexpectedResponse(stdout.into_owned())),
        }
    }

    pub async fn is_available(&self) -> bool {
        self.installed_version().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_args() {
        let mut config = EmulatorConfig::default();
        config.kernel = Some("fw.elf".to_string());
        let channel = MonitorChannel::new(config);
        assert_eq!(channel.binary(), DEFAULT_BINARY);
        assert_eq!(
            channel.command_args(),
            vec![
                "-machine", "mps2-an385", "-cpu", "cortex-m3", "-m", "16", "-nographic",
                "-monitor", "tcp:127.0.0.1:4444,server,nowait", "-kernel", "fw.elf",
            ]
        );
    }

    #[test]
    fn test_reset_errors_are_distinct() {
        let reset = classify_read_error(io::ErrorKind::ConnectionReset.into());
        assert!(matches!(reset, MonitorError::ConnectionReset(_)));
        let other = classify_read_error(io::ErrorKind::InvalidData.into());
        assert!(matches!(other, MonitorError::ReadError(_)));
    }
}
