// Playback Coordinator
// Per-channel playback state machine: queue, encoder, advance and cleanup

use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{ChannelId, Destination, PlayRequest, QueueItem, QueueItemSummary, QueueSnapshot};
use crate::services::{
    emit_event, ArtifactCleaner, ChannelState, ChannelStore, DestinationResolver, EncoderCommandBuilder,
    EventSink, Notifier, ProcessExit, ProcessSpawner, ProcessSupervisor, ResolveError, SupervisorError,
    EVENT_PLAYBACK_ENDED, EVENT_PLAYBACK_FAILED, EVENT_PLAYBACK_QUEUED, EVENT_PLAYBACK_SKIPPED,
    EVENT_PLAYBACK_STARTED, EVENT_PLAYBACK_STOPPED,
};

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("No stream key is set for channel {0}. Set one with bind_key first.")]
    NotConfigured(ChannelId),

    #[error("Failed to resolve media: {0}")]
    ResolutionFailed(#[from] ResolveError),

    #[error("Could not start \"{title}\": {reason}")]
    SpawnFailed { title: String, reason: String },
}

/// Where an enqueued item ended up
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum EnqueueOutcome {
    Started { item: QueueItemSummary },
    Queued { item: QueueItemSummary, position: usize },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SkipOutcome {
    /// Nothing was playing
    Idle,
    #[serde(rename_all = "camelCase")]
    Skipped {
        skipped: Option<QueueItemSummary>,
        now_playing: Option<QueueItemSummary>,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub stopped: Option<QueueItemSummary>,
    pub cleared: usize,
}

#[derive(Debug, Default)]
struct AdvanceResult {
    playing: Option<QueueItemSummary>,
    failed: Vec<(QueueItemSummary, String)>,
}

/// Collaborators the coordinator is built from
pub struct PlaybackDeps {
    pub resolver: DestinationResolver,
    pub builder: EncoderCommandBuilder,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub grace_period: Duration,
    pub notifier: Arc<dyn Notifier>,
    pub cleaner: Arc<dyn ArtifactCleaner>,
    pub events: Arc<dyn EventSink>,
}

/// Cheap to clone; all clones drive the same channels
#[derive(Clone)]
pub struct PlaybackCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    store: ChannelStore,
    resolver: DestinationResolver,
    builder: EncoderCommandBuilder,
    supervisor: ProcessSupervisor,
    notifier: Arc<dyn Notifier>,
    cleaner: Arc<dyn ArtifactCleaner>,
    events: Arc<dyn EventSink>,
}

impl PlaybackCoordinator {
    /// Must be called from within a tokio runtime (spawns the completion loop)
    pub fn new(deps: PlaybackDeps) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(CoordinatorInner {
            store: ChannelStore::new(),
            resolver: deps.resolver,
            builder: deps.builder,
            supervisor: ProcessSupervisor::new(deps.spawner, deps.grace_period, exit_tx),
            notifier: deps.notifier,
            cleaner: deps.cleaner,
            events: deps.events,
        });

        tokio::spawn(run_completion_loop(Arc::downgrade(&inner), exit_rx));
        Self { inner }
    }

    /// Bind or replace the stream key. Items already playing keep their destination.
    pub fn bind_key(&self, channel: &ChannelId, key: &str) -> Result<(), String> {
        self.inner.resolver.bind(channel, key)
    }

    pub fn destination(&self, channel: &ChannelId) -> Result<Destination, PlaybackError> {
        self.inner
            .resolver
            .resolve(channel)
            .ok_or_else(|| PlaybackError::NotConfigured(channel.clone()))
    }

    /// Queue an item, starting it right away when the channel is idle.
    ///
    /// Fails with `NotConfigured` before touching the queue when no key is bound;
    /// the request's cleanup file is removed in that case.
    pub async fn enqueue(&self, channel: &ChannelId, request: PlayRequest) -> Result<EnqueueOutcome, PlaybackError> {
        let destination = match self.destination(channel) {
            Ok(destination) => destination,
            Err(e) => {
                if let Some(path) = request.cleanup_path.as_deref() {
                    self.inner.cleaner.remove(path);
                }
                return Err(e);
            }
        };

        let item = QueueItem::from_request(request, destination);
        let item_id = item.id;
        let summary = item.summary();

        let shared = self.inner.store.entry(channel);
        let mut state = shared.lock().await;
        let position = state.queue.enqueue(item);

        if state.is_playing() {
            log::info!("Queued \"{}\" on channel {channel} at position {position}", summary.title);
            emit_event(
                self.inner.events.as_ref(),
                EVENT_PLAYBACK_QUEUED,
                &json!({ "channelId": channel, "item": &summary, "position": position }),
            );
            self.inner.notify(
                channel,
                format!("📥 Queued #{position}: {} (requested by {})", summary.title, summary.requester),
                None,
            );
            return Ok(EnqueueOutcome::Queued { item: summary, position });
        }

        let result = self.inner.advance(channel, &mut state);
        if result.playing.as_ref().is_some_and(|playing| playing.id == item_id) {
            return Ok(EnqueueOutcome::Started { item: summary });
        }
        if let Some((_, reason)) = result.failed.into_iter().find(|(failed, _)| failed.id == item_id) {
            return Err(PlaybackError::SpawnFailed {
                title: summary.title,
                reason,
            });
        }

        let position = state
            .queue
            .peek_all()
            .position(|pending| pending.id == item_id)
            .map_or(position, |index| index + 1);
        Ok(EnqueueOutcome::Queued { item: summary, position })
    }

    /// Stop the current item and move on. The queue is kept; no-op when idle.
    pub async fn skip(&self, channel: &ChannelId) -> SkipOutcome {
        let Some(shared) = self.inner.store.get(channel) else {
            return SkipOutcome::Idle;
        };
        let mut state = shared.lock().await;

        let Some(stopped) = self.inner.supervisor.stop(&mut state.process).await else {
            return SkipOutcome::Idle;
        };
        let skipped = state.now_playing.take().map(|item| item.summary());
        if let Some(path) = stopped.cleanup_path.as_deref() {
            self.inner.cleaner.remove(path);
        }

        log::info!(
            "Skipped \"{}\" on channel {channel}",
            skipped.as_ref().map_or("unknown", |item| item.title.as_str())
        );
        emit_event(
            self.inner.events.as_ref(),
            EVENT_PLAYBACK_SKIPPED,
            &json!({ "channelId": channel, "item": &skipped }),
        );

        let result = self.inner.advance(channel, &mut state);
        SkipOutcome::Skipped {
            skipped,
            now_playing: result.playing,
        }
    }

    /// Stop the current item and drop everything queued behind it
    pub async fn stop(&self, channel: &ChannelId) -> StopOutcome {
        let Some(shared) = self.inner.store.get(channel) else {
            return StopOutcome::default();
        };
        let mut state = shared.lock().await;

        let stopped = match self.inner.supervisor.stop(&mut state.process).await {
            Some(process) => {
                if let Some(path) = process.cleanup_path.as_deref() {
                    self.inner.cleaner.remove(path);
                }
                state.now_playing.take().map(|item| item.summary())
            }
            None => None,
        };

        let cleared = state.queue.clear();
        for item in &cleared {
            if let Some(path) = item.cleanup_path.as_deref() {
                self.inner.cleaner.remove(path);
            }
        }

        let outcome = StopOutcome {
            stopped,
            cleared: cleared.len(),
        };
        if outcome.stopped.is_some() || outcome.cleared > 0 {
            log::info!(
                "Stopped channel {channel} ({} pending item(s) cleared)",
                outcome.cleared
            );
            emit_event(
                self.inner.events.as_ref(),
                EVENT_PLAYBACK_STOPPED,
                &json!({ "channelId": channel, "stopped": &outcome.stopped, "cleared": outcome.cleared }),
            );
        }
        outcome
    }

    /// Stop every channel; used on shutdown
    pub async fn stop_all(&self) {
        for channel in self.inner.store.channel_ids() {
            self.stop(&channel).await;
        }
    }

    pub async fn snapshot(&self, channel: &ChannelId) -> QueueSnapshot {
        let Some(shared) = self.inner.store.get(channel) else {
            return QueueSnapshot::default();
        };
        let state = shared.lock().await;
        QueueSnapshot {
            now_playing: state.now_playing.as_ref().map(QueueItem::summary),
            pending: state.queue.peek_all().map(QueueItem::summary).collect(),
        }
    }

    pub async fn is_playing(&self, channel: &ChannelId) -> bool {
        match self.inner.store.get(channel) {
            Some(shared) => shared.lock().await.is_playing(),
            None => false,
        }
    }

    pub async fn active_channel_count(&self) -> usize {
        let mut active = 0;
        for channel in self.inner.store.channel_ids() {
            if self.is_playing(&channel).await {
                active += 1;
            }
        }
        active
    }
}

impl CoordinatorInner {
    /// Start the next startable item. Items that fail to spawn are dropped
    /// (cleanup file removed) and the next one is tried.
    fn advance(&self, channel: &ChannelId, state: &mut ChannelState) -> AdvanceResult {
        let mut result = AdvanceResult::default();
        if state.is_playing() {
            log::error!("advance called on channel {channel} while an encoder is running");
            debug_assert!(false, "advance called while an encoder is running");
            return result;
        }

        while let Some(item) = state.queue.dequeue_front() {
            // Re-resolve so a rebind applies to items started after it
            let destination = self.resolver.resolve(channel).unwrap_or_else(|| item.destination.clone());
            let command = self.builder.build(item.profile, &item.input, &destination);

            match self
                .supervisor
                .start(channel, &mut state.process, &command, item.cleanup_path.clone())
            {
                Ok(generation) => {
                    log::info!("Now playing on channel {channel}: \"{}\" (generation {generation})", item.title);
                    let summary = item.summary();
                    emit_event(
                        self.events.as_ref(),
                        EVENT_PLAYBACK_STARTED,
                        &json!({ "channelId": channel, "item": &summary, "destination": destination.redacted() }),
                    );
                    self.notify(
                        channel,
                        item.notification.caption.clone(),
                        item.notification.thumbnail_url.clone(),
                    );
                    result.playing = Some(summary);
                    state.now_playing = Some(item);
                    return result;
                }
                Err(SupervisorError::AlreadyRunning) => {
                    log::error!("Encoder already running on channel {channel}; dropping \"{}\"", item.title);
                    debug_assert!(false, "start called with an occupied process slot");
                    self.remove_artifact(item.cleanup_path.as_deref());
                    return result;
                }
                Err(SupervisorError::SpawnFailed(e)) => {
                    log::error!("Failed to start encoder on channel {channel} for \"{}\": {e}", item.title);
                    self.remove_artifact(item.cleanup_path.as_deref());
                    let summary = item.summary();
                    emit_event(
                        self.events.as_ref(),
                        EVENT_PLAYBACK_FAILED,
                        &json!({ "channelId": channel, "item": &summary, "error": e.to_string() }),
                    );
                    self.notify(channel, format!("⚠️ Could not start {}: {e}", item.title), None);
                    result.failed.push((summary, e.to_string()));
                }
            }
        }

        log::info!("Queue empty on channel {channel}, now idle");
        result
    }

    /// Natural exit of a supervised encoder. Stale exits are ignored.
    async fn handle_exit(&self, exit: ProcessExit) {
        let Some(shared) = self.store.get(&exit.channel) else {
            return;
        };
        let mut state = shared.lock().await;

        if !state.process.release_exited(exit.generation) {
            log::debug!(
                "Ignoring stale exit on channel {} (generation {})",
                exit.channel,
                exit.generation
            );
            return;
        }

        let channel = exit.channel;
        let finished = state.now_playing.take();
        self.remove_artifact(exit.cleanup_path.as_deref());

        if let Some(item) = finished {
            let summary = item.summary();
            if exit.report.success {
                log::info!("Stream ended on channel {channel}: \"{}\"", item.title);
                emit_event(
                    self.events.as_ref(),
                    EVENT_PLAYBACK_ENDED,
                    &json!({ "channelId": &channel, "item": &summary }),
                );
                self.notify(&channel, format!("⏹️ Stream ended: {}", item.title), None);
            } else {
                let reason = exit.report.describe();
                log::error!("Stream failed on channel {channel}: \"{}\": {reason}", item.title);
                emit_event(
                    self.events.as_ref(),
                    EVENT_PLAYBACK_FAILED,
                    &json!({ "channelId": &channel, "item": &summary, "error": &reason, "exit": &exit.report }),
                );
                self.notify(&channel, format!("⚠️ Stream failed: {} ({reason})", item.title), None);
            }
        }

        self.advance(&channel, &mut state);
    }

    fn remove_artifact(&self, path: Option<&Path>) {
        if let Some(path) = path {
            self.cleaner.remove(path);
        }
    }

    /// Fire-and-forget; delivery failures are only logged
    fn notify(&self, channel: &ChannelId, message: String, thumbnail_url: Option<String>) {
        if message.is_empty() {
            return;
        }
        let notifier = Arc::clone(&self.notifier);
        let channel = channel.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&channel, &message, thumbnail_url.as_deref()).await {
                log::warn!("Notification for channel {channel} failed: {e}");
            }
        });
    }
}

async fn run_completion_loop(inner: Weak<CoordinatorInner>, mut exits: mpsc::UnboundedReceiver<ProcessExit>) {
    while let Some(exit) = exits.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        // One task per exit so a busy channel never delays another
        tokio::spawn(async move {
            inner.handle_exit(exit).await;
        });
    }
    log::debug!("Playback completion loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EncoderProfile, OnAirNotification};
    use crate::services::testing::{wait_until, FakeSpawner, RecordingCleaner, RecordingEventSink, RecordingNotifier};
    use crate::services::InMemoryKeyStore;
    use std::path::PathBuf;

    const BASE_URL: &str = "rtmp://live.test/app/";

    struct Harness {
        coordinator: PlaybackCoordinator,
        spawner: FakeSpawner,
        cleaner: Arc<RecordingCleaner>,
        notifier: Arc<RecordingNotifier>,
        events: Arc<RecordingEventSink>,
    }

    fn harness() -> Harness {
        let spawner = FakeSpawner::new();
        let cleaner = Arc::new(RecordingCleaner::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let events = Arc::new(RecordingEventSink::default());
        let coordinator = PlaybackCoordinator::new(PlaybackDeps {
            resolver: DestinationResolver::new(BASE_URL, Arc::new(InMemoryKeyStore::new())),
            builder: EncoderCommandBuilder::new("ffmpeg"),
            spawner: Arc::new(spawner.clone()),
            grace_period: Duration::from_millis(100),
            notifier: notifier.clone(),
            cleaner: cleaner.clone(),
            events: events.clone(),
        });
        Harness {
            coordinator,
            spawner,
            cleaner,
            notifier,
            events,
        }
    }

    fn request(input: &str) -> PlayRequest {
        PlayRequest {
            title: input.to_string(),
            duration: "3:00".to_string(),
            input: input.to_string(),
            profile: EncoderProfile::AudioOnly,
            notification: OnAirNotification {
                caption: format!("Now playing {input}"),
                thumbnail_url: None,
            },
            requester: "tester".to_string(),
            cleanup_path: None,
        }
    }

    fn request_with_cleanup(input: &str) -> PlayRequest {
        PlayRequest {
            cleanup_path: Some(PathBuf::from(format!("/tmp/{input}"))),
            ..request(input)
        }
    }

    fn channel(id: &str) -> ChannelId {
        ChannelId::from(id)
    }

    async fn pending_titles(h: &Harness, channel: &ChannelId) -> Vec<String> {
        h.coordinator
            .snapshot(channel)
            .await
            .pending
            .into_iter()
            .map(|item| item.title)
            .collect()
    }

    #[tokio::test]
    async fn test_fifo_playback_order() {
        let h = harness();
        let ch = channel("1");
        h.coordinator.bind_key(&ch, "key").unwrap();

        let first = h.coordinator.enqueue(&ch, request("a")).await.unwrap();
        assert!(matches!(first, EnqueueOutcome::Started { .. }));
        let second = h.coordinator.enqueue(&ch, request("b")).await.unwrap();
        assert!(matches!(second, EnqueueOutcome::Queued { position: 1, .. }));
        let third = h.coordinator.enqueue(&ch, request("c")).await.unwrap();
        assert!(matches!(third, EnqueueOutcome::Queued { position: 2, .. }));

        h.spawner.finish(0, 0);
        wait_until(|| h.spawner.spawn_count() == 2).await;
        h.spawner.finish(1, 0);
        wait_until(|| h.spawner.spawn_count() == 3).await;
        h.spawner.finish(2, 0);
        wait_until(|| h.events.count(EVENT_PLAYBACK_ENDED) == 3).await;

        assert_eq!(h.spawner.spawned_inputs(), vec!["a", "b", "c"]);
        assert!(!h.coordinator.is_playing(&ch).await);
        assert_eq!(h.spawner.max_live(&format!("{BASE_URL}key")), 1);
    }

    #[tokio::test]
    async fn test_enqueue_without_key_is_not_configured() {
        let h = harness();
        let ch = channel("1");

        let result = h.coordinator.enqueue(&ch, request_with_cleanup("a.mp3")).await;

        assert!(matches!(result, Err(PlaybackError::NotConfigured(_))));
        assert!(h.coordinator.snapshot(&ch).await.pending.is_empty());
        assert_eq!(h.spawner.spawn_count(), 0);
        assert_eq!(h.cleaner.removals("/tmp/a.mp3"), 1);
    }

    #[tokio::test]
    async fn test_skip_preserves_queue() {
        let h = harness();
        let ch = channel("1");
        h.coordinator.bind_key(&ch, "key").unwrap();
        for input in ["a", "b", "c"] {
            h.coordinator.enqueue(&ch, request(input)).await.unwrap();
        }

        let outcome = h.coordinator.skip(&ch).await;

        match outcome {
            SkipOutcome::Skipped { skipped, now_playing } => {
                assert_eq!(skipped.unwrap().title, "a");
                assert_eq!(now_playing.unwrap().title, "b");
            }
            SkipOutcome::Idle => panic!("expected a skip"),
        }
        assert_eq!(pending_titles(&h, &ch).await, vec!["c"]);
        assert_eq!(h.spawner.spawned_inputs(), vec!["a", "b"]);
        assert_eq!(h.spawner.live_count(), 1);
        // Skip suppresses the natural-completion path
        assert_eq!(h.events.count(EVENT_PLAYBACK_ENDED), 0);
    }

    #[tokio::test]
    async fn test_skip_when_idle_is_noop() {
        let h = harness();
        let ch = channel("1");
        h.coordinator.bind_key(&ch, "key").unwrap();

        assert!(matches!(h.coordinator.skip(&ch).await, SkipOutcome::Idle));
        assert!(matches!(h.coordinator.skip(&channel("unknown")).await, SkipOutcome::Idle));
        assert_eq!(h.spawner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_clears_queue_and_goes_idle() {
        let h = harness();
        let ch = channel("1");
        h.coordinator.bind_key(&ch, "key").unwrap();
        for input in ["a", "b", "c"] {
            h.coordinator.enqueue(&ch, request_with_cleanup(input)).await.unwrap();
        }

        let outcome = h.coordinator.stop(&ch).await;

        assert_eq!(outcome.stopped.unwrap().title, "a");
        assert_eq!(outcome.cleared, 2);
        assert!(!h.coordinator.is_playing(&ch).await);
        assert!(h.coordinator.snapshot(&ch).await.pending.is_empty());
        assert_eq!(h.spawner.live_count(), 0);
        assert_eq!(h.spawner.spawn_count(), 1);
        for path in ["/tmp/a", "/tmp/b", "/tmp/c"] {
            assert_eq!(h.cleaner.removals(path), 1);
        }
    }

    #[tokio::test]
    async fn test_stop_twice_on_idle_channel_is_noop() {
        let h = harness();
        let ch = channel("1");
        h.coordinator.bind_key(&ch, "key").unwrap();

        let first = h.coordinator.stop(&ch).await;
        let second = h.coordinator.stop(&ch).await;

        assert!(first.stopped.is_none() && first.cleared == 0);
        assert!(second.stopped.is_none() && second.cleared == 0);
        assert_eq!(h.events.count(EVENT_PLAYBACK_STOPPED), 0);
    }

    #[tokio::test]
    async fn test_cleanup_exactly_once_on_natural_finish() {
        let h = harness();
        let ch = channel("1");
        h.coordinator.bind_key(&ch, "key").unwrap();
        h.coordinator.enqueue(&ch, request_with_cleanup("a")).await.unwrap();

        h.spawner.finish(0, 0);
        wait_until(|| h.cleaner.removals("/tmp/a") == 1).await;
        wait_until(|| h.events.count(EVENT_PLAYBACK_ENDED) == 1).await;

        // A later stop must not delete it again
        h.coordinator.stop(&ch).await;
        assert_eq!(h.cleaner.removals("/tmp/a"), 1);
        assert!(!h.coordinator.is_playing(&ch).await);
    }

    #[tokio::test]
    async fn test_cleanup_exactly_once_on_skip() {
        let h = harness();
        let ch = channel("1");
        h.coordinator.bind_key(&ch, "key").unwrap();
        h.coordinator.enqueue(&ch, request_with_cleanup("a")).await.unwrap();

        h.coordinator.skip(&ch).await;
        h.coordinator.skip(&ch).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(h.cleaner.removals("/tmp/a"), 1);
        assert_eq!(h.cleaner.total(), 1);
    }

    #[tokio::test]
    async fn test_stop_racing_natural_exit_cleans_once_and_does_not_advance() {
        let h = harness();
        let ch = channel("1");
        h.coordinator.bind_key(&ch, "key").unwrap();
        h.coordinator.enqueue(&ch, request_with_cleanup("a")).await.unwrap();
        h.coordinator.enqueue(&ch, request_with_cleanup("b")).await.unwrap();

        // Exit is in flight while stop takes the channel
        h.spawner.finish(0, 0);
        h.coordinator.stop(&ch).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.cleaner.removals("/tmp/a"), 1);
        assert_eq!(h.cleaner.removals("/tmp/b"), 1);
        assert_eq!(h.spawner.spawn_count(), 1);
        assert!(!h.coordinator.is_playing(&ch).await);
    }

    #[tokio::test]
    async fn test_spawn_failure_advances_to_next_item() {
        let h = harness();
        let ch = channel("1");
        h.coordinator.bind_key(&ch, "key").unwrap();
        h.spawner.fail_spawn("b");

        h.coordinator.enqueue(&ch, request("a")).await.unwrap();
        h.coordinator.enqueue(&ch, request_with_cleanup("b")).await.unwrap();
        h.coordinator.enqueue(&ch, request("c")).await.unwrap();

        h.spawner.finish(0, 0);
        wait_until(|| h.spawner.spawn_count() == 2).await;

        assert_eq!(h.spawner.attempted_inputs(), vec!["a", "b", "c"]);
        assert_eq!(h.spawner.spawned_inputs(), vec!["a", "c"]);
        assert_eq!(h.cleaner.removals("/tmp/b"), 1);
        assert_eq!(h.coordinator.snapshot(&ch).await.now_playing.unwrap().title, "c");
        wait_until(|| h.events.count(EVENT_PLAYBACK_FAILED) == 1).await;
    }

    #[tokio::test]
    async fn test_spawn_failure_on_idle_enqueue_is_reported() {
        let h = harness();
        let ch = channel("1");
        h.coordinator.bind_key(&ch, "key").unwrap();
        h.spawner.fail_spawn("a");

        let result = h.coordinator.enqueue(&ch, request_with_cleanup("a")).await;

        assert!(matches!(result, Err(PlaybackError::SpawnFailed { .. })));
        assert!(!h.coordinator.is_playing(&ch).await);
        assert_eq!(h.cleaner.removals("/tmp/a"), 1);
    }

    #[tokio::test]
    async fn test_failed_exit_still_advances() {
        let h = harness();
        let ch = channel("1");
        h.coordinator.bind_key(&ch, "key").unwrap();
        h.coordinator.enqueue(&ch, request("a")).await.unwrap();
        h.coordinator.enqueue(&ch, request("b")).await.unwrap();

        h.spawner.finish(0, 1);
        wait_until(|| h.spawner.spawn_count() == 2).await;

        wait_until(|| h.events.count(EVENT_PLAYBACK_FAILED) == 1).await;
        assert_eq!(h.events.count(EVENT_PLAYBACK_ENDED), 0);
        assert_eq!(h.coordinator.snapshot(&ch).await.now_playing.unwrap().title, "b");
    }

    #[tokio::test]
    async fn test_rebind_applies_to_next_item_only() {
        let h = harness();
        let ch = channel("1");
        h.coordinator.bind_key(&ch, "old").unwrap();
        h.coordinator.enqueue(&ch, request("a")).await.unwrap();
        h.coordinator.enqueue(&ch, request("b")).await.unwrap();

        h.coordinator.bind_key(&ch, "new").unwrap();
        assert_eq!(h.spawner.spawned_outputs(), vec![format!("{BASE_URL}old")]);

        h.spawner.finish(0, 0);
        wait_until(|| h.spawner.spawn_count() == 2).await;
        assert_eq!(
            h.spawner.spawned_outputs(),
            vec![format!("{BASE_URL}old"), format!("{BASE_URL}new")]
        );
    }

    #[tokio::test]
    async fn test_stubborn_encoder_is_killed_on_skip() {
        let h = harness();
        let ch = channel("1");
        h.coordinator.bind_key(&ch, "key").unwrap();
        h.spawner.ignore_terminate("a");
        h.coordinator.enqueue(&ch, request("a")).await.unwrap();
        h.coordinator.enqueue(&ch, request("b")).await.unwrap();

        let started = std::time::Instant::now();
        h.coordinator.skip(&ch).await;

        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(h.spawner.live_count(), 1);
        assert_eq!(h.spawner.max_live(&format!("{BASE_URL}key")), 1);
    }

    #[tokio::test]
    async fn test_at_most_one_encoder_per_channel_under_interleaving() {
        let h = harness();
        let channels: Vec<ChannelId> = (0..4).map(|i| channel(&i.to_string())).collect();
        for ch in &channels {
            h.coordinator.bind_key(ch, &format!("key{ch}")).unwrap();
        }

        let mut tasks = Vec::new();
        for ch in channels.clone() {
            let coordinator = h.coordinator.clone();
            tasks.push(tokio::spawn(async move {
                for round in 0..5 {
                    coordinator.enqueue(&ch, request(&format!("{ch}-{round}"))).await.unwrap();
                    coordinator.enqueue(&ch, request(&format!("{ch}-{round}b"))).await.unwrap();
                    if round % 2 == 0 {
                        coordinator.skip(&ch).await;
                    } else {
                        coordinator.stop(&ch).await;
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for ch in &channels {
            assert_eq!(h.spawner.max_live(&format!("{BASE_URL}key{ch}")), 1);
        }
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let h = harness();
        let (one, two) = (channel("1"), channel("2"));
        h.coordinator.bind_key(&one, "k1").unwrap();
        h.coordinator.bind_key(&two, "k2").unwrap();

        h.coordinator.enqueue(&one, request("a")).await.unwrap();
        h.coordinator.enqueue(&two, request("b")).await.unwrap();
        h.coordinator.stop(&one).await;

        assert!(!h.coordinator.is_playing(&one).await);
        assert!(h.coordinator.is_playing(&two).await);
        assert_eq!(h.coordinator.active_channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_started_event_hides_stream_key() {
        let h = harness();
        let ch = channel("1");
        h.coordinator.bind_key(&ch, "secret-key-123").unwrap();

        h.coordinator.enqueue(&ch, request("a")).await.unwrap();

        let started = h.events.payloads(EVENT_PLAYBACK_STARTED);
        assert_eq!(started.len(), 1);
        assert_eq!(started[0]["channelId"], "1");
        assert_eq!(started[0]["item"]["title"], "a");
        assert_eq!(started[0]["destination"], format!("{BASE_URL}***"));
        assert!(!started[0].to_string().contains("secret-key-123"));
        // The encoder itself still gets the real destination
        assert_eq!(h.spawner.spawned_outputs(), vec![format!("{BASE_URL}secret-key-123")]);
    }

    #[tokio::test]
    async fn test_on_air_notification_is_sent() {
        let h = harness();
        let ch = channel("1");
        h.coordinator.bind_key(&ch, "key").unwrap();
        let mut req = request("a");
        req.notification.thumbnail_url = Some("https://img.test/a.jpg".to_string());

        h.coordinator.enqueue(&ch, req).await.unwrap();
        h.coordinator.enqueue(&ch, request("b")).await.unwrap();

        wait_until(|| h.notifier.messages(&ch).len() == 2).await;
        let messages = h.notifier.messages(&ch);
        assert!(messages.contains(&"Now playing a".to_string()));
        assert!(messages.iter().any(|m| m.starts_with("📥 Queued #1: b")));
        assert!(h.notifier.thumbnails().contains(&Some("https://img.test/a.jpg".to_string())));
    }
}
