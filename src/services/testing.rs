// Test doubles shared by the service tests

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::models::ChannelId;
use crate::services::{
    ArtifactCleaner, EncoderCommand, EncoderProcess, EventSink, ExitReport, Notifier, NotifyError, ProcessSpawner,
};

/// Poll `condition` until it holds, panicking after two seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within 2s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

struct SpawnRecord {
    input: String,
    output: String,
    exit: Arc<watch::Sender<Option<ExitReport>>>,
}

#[derive(Default)]
struct FakeState {
    spawns: Vec<SpawnRecord>,
    attempts: Vec<String>,
    live: HashMap<String, usize>,
    max_live: HashMap<String, usize>,
    failing_inputs: HashSet<String>,
    stubborn_inputs: HashSet<String>,
}

/// Scripted spawner: processes run until the test ends them
#[derive(Clone, Default)]
pub struct FakeSpawner {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawning a command whose input is `input` fails
    pub fn fail_spawn(&self, input: &str) {
        self.state.lock().unwrap().failing_inputs.insert(input.to_string());
    }

    /// Processes for `input` ignore graceful termination
    pub fn ignore_terminate(&self, input: &str) {
        self.state.lock().unwrap().stubborn_inputs.insert(input.to_string());
    }

    /// End the `index`-th spawned process with `code`
    pub fn finish(&self, index: usize, code: i32) {
        let state = self.state.lock().unwrap();
        let report = if code == 0 {
            ExitReport::success()
        } else {
            ExitReport::failed(Some(code), Some("scripted failure".to_string()))
        };
        state.spawns[index].exit.send_replace(Some(report));
    }

    pub fn spawn_count(&self) -> usize {
        self.state.lock().unwrap().spawns.len()
    }

    /// Inputs of successful spawns in order
    pub fn spawned_inputs(&self) -> Vec<String> {
        self.state.lock().unwrap().spawns.iter().map(|s| s.input.clone()).collect()
    }

    pub fn spawned_outputs(&self) -> Vec<String> {
        self.state.lock().unwrap().spawns.iter().map(|s| s.output.clone()).collect()
    }

    /// Inputs of every spawn attempt, failed ones included
    pub fn attempted_inputs(&self) -> Vec<String> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().live.values().sum()
    }

    /// Highest number of simultaneously live processes seen for one output
    pub fn max_live(&self, output: &str) -> usize {
        self.state.lock().unwrap().max_live.get(output).copied().unwrap_or(0)
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, command: &EncoderCommand) -> io::Result<Box<dyn EncoderProcess>> {
        let input = command
            .args
            .iter()
            .position(|arg| arg == "-i")
            .and_then(|i| command.args.get(i + 1))
            .cloned()
            .unwrap_or_default();
        let output = command.output().unwrap_or_default().to_string();

        let mut state = self.state.lock().unwrap();
        state.attempts.push(input.clone());
        if state.failing_inputs.contains(&input) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "scripted spawn failure"));
        }

        let (tx, rx) = watch::channel(None);
        let exit = Arc::new(tx);
        state.spawns.push(SpawnRecord {
            input: input.clone(),
            output: output.clone(),
            exit: Arc::clone(&exit),
        });

        let live = {
            let count = state.live.entry(output.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let max = state.max_live.entry(output.clone()).or_insert(0);
        *max = (*max).max(live);

        Ok(Box::new(FakeProcess {
            output,
            stubborn: state.stubborn_inputs.contains(&input),
            exit,
            exit_rx: rx,
            alive: true,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeProcess {
    output: String,
    stubborn: bool,
    exit: Arc<watch::Sender<Option<ExitReport>>>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
    alive: bool,
    state: Arc<Mutex<FakeState>>,
}

impl FakeProcess {
    fn mark_dead(&mut self) {
        if !self.alive {
            return;
        }
        self.alive = false;
        if let Ok(mut state) = self.state.lock() {
            if let Some(count) = state.live.get_mut(&self.output) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

#[async_trait]
impl EncoderProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> io::Result<ExitReport> {
        loop {
            let current = self.exit_rx.borrow().clone();
            if let Some(report) = current {
                self.mark_dead();
                return Ok(report);
            }
            if self.exit_rx.changed().await.is_err() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "exit channel closed"));
            }
        }
    }

    async fn terminate(&mut self) {
        if !self.stubborn {
            self.exit.send_if_modified(|exit| {
                if exit.is_none() {
                    *exit = Some(ExitReport::failed(Some(255), Some("terminated".to_string())));
                    true
                } else {
                    false
                }
            });
        }
    }

    async fn kill(&mut self) {
        self.exit.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(ExitReport::failed(None, Some("killed".to_string())));
                true
            } else {
                false
            }
        });
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        self.mark_dead();
    }
}

/// Counts removal requests per path
#[derive(Default)]
pub struct RecordingCleaner {
    removed: Mutex<Vec<PathBuf>>,
}

impl RecordingCleaner {
    pub fn removals(&self, path: &str) -> usize {
        self.removed
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.as_path() == Path::new(path))
            .count()
    }

    pub fn total(&self) -> usize {
        self.removed.lock().unwrap().len()
    }
}

impl ArtifactCleaner for RecordingCleaner {
    fn remove(&self, path: &Path) {
        self.removed.lock().unwrap().push(path.to_path_buf());
    }
}

/// Captures notifications per channel
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(ChannelId, String, Option<String>)>>,
}

impl RecordingNotifier {
    pub fn messages(&self, channel: &ChannelId) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _, _)| c == channel)
            .map(|(_, m, _)| m.clone())
            .collect()
    }

    pub fn thumbnails(&self) -> Vec<Option<String>> {
        self.messages.lock().unwrap().iter().map(|(_, _, t)| t.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, channel: &ChannelId, message: &str, thumbnail_url: Option<&str>) -> Result<(), NotifyError> {
        self.messages.lock().unwrap().push((
            channel.clone(),
            message.to_string(),
            thumbnail_url.map(str::to_string),
        ));
        Ok(())
    }
}

/// Captures emitted events for assertions
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingEventSink {
    pub fn names(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|(name, _)| name == event).count()
    }

    pub fn payloads(&self, event: &str) -> Vec<Value> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: &str, payload: Value) {
        self.events.lock().unwrap().push((event.to_string(), payload));
    }
}
