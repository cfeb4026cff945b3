// Encoder Process
// Spawns FFmpeg subprocesses and reports how they exited

use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::task::JoinHandle;

use crate::models::redact_rtmp_urls_in;
use crate::services::EncoderCommand;

// Windows: Hide console windows for spawned processes
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

const STDERR_TAIL_LINES: usize = 40;
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How an encoder process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitReport {
    /// Exit code; `None` when terminated by a signal or never observed
    pub code: Option<i32>,
    pub success: bool,
    /// Best-effort explanation taken from the encoder's last stderr lines
    pub detail: Option<String>,
}

impl ExitReport {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            success: true,
            detail: None,
        }
    }

    pub fn failed(code: Option<i32>, detail: Option<String>) -> Self {
        Self {
            code,
            success: false,
            detail,
        }
    }

    /// The exit could not be observed (wait failed, watcher panicked)
    pub fn lost(detail: impl Into<String>) -> Self {
        Self::failed(None, Some(detail.into()))
    }

    pub fn describe(&self) -> String {
        let base = match (self.success, self.code) {
            (true, _) => "Encoder finished".to_string(),
            (false, Some(code)) => format!("Encoder exited with code {code}"),
            (false, None) => "Encoder terminated unexpectedly".to_string(),
        };
        match &self.detail {
            Some(detail) => format!("{base}: {detail}"),
            None => base,
        }
    }
}

/// A running encoder
#[async_trait]
pub trait EncoderProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit. Safe to call again after a cancelled wait.
    async fn wait(&mut self) -> io::Result<ExitReport>;

    /// Ask the encoder to finish gracefully
    async fn terminate(&mut self);

    /// Forcibly kill the encoder
    async fn kill(&mut self);
}

/// Starts encoder processes; injected so tests can script process behaviour
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: &EncoderCommand) -> io::Result<Box<dyn EncoderProcess>>;
}

/// Spawns real FFmpeg processes via tokio
#[derive(Debug, Default, Clone)]
pub struct FfmpegSpawner;

impl FfmpegSpawner {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessSpawner for FfmpegSpawner {
    fn spawn(&self, command: &EncoderCommand) -> io::Result<Box<dyn EncoderProcess>> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        // Child::wait closes a stdin it still owns, which would swallow the later 'q'
        let stdin = child.stdin.take();
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let stderr_reader = child.stderr.take().map(|stderr| {
            let label = pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string());
            tokio::spawn(read_stderr(stderr, label, Arc::clone(&tail)))
        });

        Ok(Box::new(FfmpegProcess {
            child,
            stdin,
            pid,
            stderr_tail: tail,
            stderr_reader,
        }))
    }
}

struct FfmpegProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_reader: Option<JoinHandle<()>>,
}

#[async_trait]
impl EncoderProcess for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> io::Result<ExitReport> {
        let status = self.child.wait().await?;

        // Let the reader catch the final lines before explaining the exit
        if let Some(reader) = self.stderr_reader.take() {
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, reader).await;
        }

        if status.success() {
            return Ok(ExitReport::success());
        }

        let detail = match self.stderr_tail.lock() {
            Ok(lines) => parse_error_details(&lines),
            Err(_) => None,
        };
        Ok(ExitReport::failed(status.code(), detail))
    }

    async fn terminate(&mut self) {
        // FFmpeg finishes the output cleanly on 'q'
        let Some(stdin) = self.stdin.as_mut() else {
            return;
        };
        if let Err(e) = stdin.write_all(b"q\n").await {
            log::debug!("Could not send quit to encoder (pid {:?}): {e}", self.pid);
            return;
        }
        let _ = stdin.flush().await;
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            log::warn!("Failed to kill encoder (pid {:?}): {e}", self.pid);
        }
    }
}

async fn read_stderr(stderr: ChildStderr, label: String, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let sanitized = redact_rtmp_urls_in(&line);
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(sanitized.clone());
        }

        let lower = sanitized.to_lowercase();
        if lower.contains("error") || lower.contains("warning") || lower.contains("failed") {
            log::warn!("[FFmpeg:{label}] {sanitized}");
        }
    }
}

/// Pick a human-readable cause out of the encoder's last stderr lines
pub fn parse_error_details(lines: &VecDeque<String>) -> Option<String> {
    for line in lines.iter().rev() {
        if line.contains("No such file or directory") {
            return Some("Input file not found".to_string());
        }
        if line.contains("Invalid data found when processing input") {
            return Some("Input is not a playable media file".to_string());
        }
        if line.contains("Server returned 403") || line.contains("Server returned 404") {
            return Some("Remote input is unavailable".to_string());
        }
        if line.contains("Connection refused") {
            return Some("RTMP server refused connection".to_string());
        }
        if line.contains("Connection timed out") {
            return Some("RTMP server connection timed out".to_string());
        }
        if line.contains("Broken pipe") || line.contains("Connection reset by peer") {
            return Some("RTMP server closed the connection".to_string());
        }
        if line.contains("error muxing packet") {
            return Some("Failed to send packet to server (possible network issue)".to_string());
        }
    }
    lines.back().cloned()
}
