// Process Supervisor
// Owns at most one encoder process per channel and reports natural exits

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::models::ChannelId;
use crate::services::{EncoderCommand, EncoderProcess, ExitReport, ProcessSpawner};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("An encoder is already running for this channel")]
    AlreadyRunning,

    #[error("Failed to start encoder: {0}")]
    SpawnFailed(#[from] io::Error),
}

/// Sent once when a supervised process exits on its own.
/// Processes ended through [`ProcessSupervisor::stop`] never produce one.
#[derive(Debug)]
pub struct ProcessExit {
    pub channel: ChannelId,
    pub generation: u64,
    pub report: ExitReport,
    pub cleanup_path: Option<PathBuf>,
}

/// Result of an explicit stop
#[derive(Debug)]
pub struct StoppedProcess {
    pub generation: u64,
    pub report: ExitReport,
    pub cleanup_path: Option<PathBuf>,
}

struct ActiveProcess {
    generation: u64,
    pid: Option<u32>,
    started_at: Instant,
    cleanup_path: Option<PathBuf>,
    stop_tx: oneshot::Sender<()>,
    watcher: JoinHandle<ExitReport>,
}

/// Per-channel handle slot
#[derive(Default)]
pub struct ProcessSlot {
    active: Option<ActiveProcess>,
    next_generation: u64,
}

impl ProcessSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Release the slot for a process that exited on its own.
    /// Returns false when `generation` is no longer the tracked process.
    pub fn release_exited(&mut self, generation: u64) -> bool {
        match &self.active {
            Some(active) if active.generation == generation => {
                self.active = None;
                true
            }
            _ => false,
        }
    }
}

struct ExitRoute {
    channel: ChannelId,
    generation: u64,
    cleanup_path: Option<PathBuf>,
    exits: mpsc::UnboundedSender<ProcessExit>,
}

enum WatchOutcome {
    Exited(io::Result<ExitReport>),
    StopRequested,
}

pub struct ProcessSupervisor {
    spawner: Arc<dyn ProcessSpawner>,
    grace_period: Duration,
    exits: mpsc::UnboundedSender<ProcessExit>,
}

impl ProcessSupervisor {
    /// Natural exits are delivered on `exits`
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        grace_period: Duration,
        exits: mpsc::UnboundedSender<ProcessExit>,
    ) -> Self {
        Self {
            spawner,
            grace_period,
            exits,
        }
    }

    /// Spawn the encoder into an empty slot. Must be called from within a tokio runtime.
    pub fn start(
        &self,
        channel: &ChannelId,
        slot: &mut ProcessSlot,
        command: &EncoderCommand,
        cleanup_path: Option<PathBuf>,
    ) -> Result<u64, SupervisorError> {
        if slot.active.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        log::info!("Starting encoder for channel {channel}: {}", command.redacted());
        let process = self.spawner.spawn(command)?;
        let pid = process.pid();

        slot.next_generation += 1;
        let generation = slot.next_generation;

        let (stop_tx, stop_rx) = oneshot::channel();
        let route = ExitRoute {
            channel: channel.clone(),
            generation,
            cleanup_path: cleanup_path.clone(),
            exits: self.exits.clone(),
        };
        let watcher = tokio::spawn(watch_process(process, stop_rx, self.grace_period, route));

        log::debug!("Encoder for channel {channel} running (pid {pid:?}, generation {generation})");
        slot.active = Some(ActiveProcess {
            generation,
            pid,
            started_at: Instant::now(),
            cleanup_path,
            stop_tx,
            watcher,
        });
        Ok(generation)
    }

    /// Stop the tracked process, waiting until it has fully exited.
    /// Returns `None` when nothing was running.
    pub async fn stop(&self, slot: &mut ProcessSlot) -> Option<StoppedProcess> {
        let active = slot.active.take()?;
        let ActiveProcess {
            generation,
            pid,
            started_at,
            cleanup_path,
            stop_tx,
            watcher,
        } = active;

        log::info!(
            "Stopping encoder (pid {pid:?}, generation {generation}) after {}s",
            started_at.elapsed().as_secs()
        );
        // Fails only when the process already exited; the watcher result still holds its report
        let _ = stop_tx.send(());

        let report = match watcher.await {
            Ok(report) => report,
            Err(e) => {
                log::error!("Encoder watcher for generation {generation} failed: {e}");
                ExitReport::lost(format!("Watcher failed: {e}"))
            }
        };

        Some(StoppedProcess {
            generation,
            report,
            cleanup_path,
        })
    }
}

async fn watch_process(
    mut process: Box<dyn EncoderProcess>,
    stop_rx: oneshot::Receiver<()>,
    grace_period: Duration,
    route: ExitRoute,
) -> ExitReport {
    let outcome = tokio::select! {
        result = process.wait() => WatchOutcome::Exited(result),
        _ = stop_rx => WatchOutcome::StopRequested,
    };

    match outcome {
        WatchOutcome::Exited(result) => {
            // Release the process before anyone can start its successor
            drop(process);
            let report = result.unwrap_or_else(|e| ExitReport::lost(format!("Failed to wait for encoder: {e}")));
            let exit = ProcessExit {
                channel: route.channel,
                generation: route.generation,
                report: report.clone(),
                cleanup_path: route.cleanup_path,
            };
            if route.exits.send(exit).is_err() {
                log::debug!("Exit receiver closed; dropping exit notification");
            }
            report
        }
        WatchOutcome::StopRequested => shutdown(process.as_mut(), grace_period).await,
    }
}

/// Graceful terminate, then kill once the grace period runs out
async fn shutdown(process: &mut dyn EncoderProcess, grace_period: Duration) -> ExitReport {
    process.terminate().await;

    match tokio::time::timeout(grace_period, process.wait()).await {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => ExitReport::lost(format!("Failed to wait for encoder: {e}")),
        Err(_) => {
            log::warn!(
                "Encoder (pid {:?}) did not exit within {:?}, killing",
                process.pid(),
                grace_period
            );
            process.kill().await;
            process
                .wait()
                .await
                .unwrap_or_else(|e| ExitReport::lost(format!("Failed to wait for killed encoder: {e}")))
        }
    }
}
