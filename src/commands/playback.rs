// Playback Commands
// Request handlers for binding keys and driving per-channel playback

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::models::{
    display_duration, now_playing_caption, ChannelId, EncoderProfile, OnAirNotification, PlayRequest, QueueSnapshot,
};
use crate::services::{
    resolve_media_path, EnqueueOutcome, MediaResolver, PlaybackCoordinator, SkipOutcome, StopOutcome,
};

const UNKNOWN_REQUESTER: &str = "Unknown";
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "ogg", "oga", "opus", "wav", "flac"];

/// Optional fields shared by the play commands
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayOptions {
    #[serde(default)]
    pub requester: Option<String>,
    /// Stream video; defaults depend on the source
    #[serde(default)]
    pub video: Option<bool>,
    #[serde(default)]
    pub title: Option<String>,
}

impl PlayOptions {
    fn requester(&self) -> String {
        self.requester
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(UNKNOWN_REQUESTER)
            .to_string()
    }

    fn title_or(&self, fallback: impl FnOnce() -> String) -> String {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(fallback)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingReport {
    pub pong: bool,
    pub uptime_secs: u64,
    pub active_channels: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playing: Option<bool>,
}

pub async fn ping(
    coordinator: &PlaybackCoordinator,
    started_at: Instant,
    channel: Option<&ChannelId>,
) -> PingReport {
    let playing = match channel {
        Some(channel) => Some(coordinator.is_playing(channel).await),
        None => None,
    };
    PingReport {
        pong: true,
        uptime_secs: started_at.elapsed().as_secs(),
        active_channels: coordinator.active_channel_count().await,
        playing,
    }
}

pub fn bind_key(coordinator: &PlaybackCoordinator, channel: &ChannelId, key: &str) -> Result<(), String> {
    coordinator.bind_key(channel, key)
}

/// Play a file from the media directory. With `delete_after` the file is
/// removed once its playback ends.
pub async fn play_file(
    coordinator: &PlaybackCoordinator,
    media_dir: &Path,
    channel: &ChannelId,
    path: &str,
    options: &PlayOptions,
    delete_after: bool,
) -> Result<EnqueueOutcome, String> {
    let path = resolve_media_path(path, media_dir)?;
    let want_video = options.video.unwrap_or_else(|| !is_audio_file(&path));
    let title = options.title_or(|| {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Untitled".to_string())
    });

    let request = build_request(
        title,
        display_duration(None),
        path.to_string_lossy().into_owned(),
        want_video,
        options.requester(),
        None,
        delete_after.then(|| path.clone()),
    );
    coordinator.enqueue(channel, request).await.map_err(|e| e.to_string())
}

/// Play a direct media URL (http, https, rtmp or rtmps)
pub async fn play_url(
    coordinator: &PlaybackCoordinator,
    channel: &ChannelId,
    url: &str,
    options: &PlayOptions,
) -> Result<EnqueueOutcome, String> {
    let url = url.trim();
    if !is_supported_url(url) {
        return Err("Send a direct media URL (http, https, rtmp or rtmps)".to_string());
    }

    let title = options.title_or(|| {
        url.rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(url)
            .to_string()
    });
    let request = build_request(
        title,
        display_duration(None),
        url.to_string(),
        options.video.unwrap_or(true),
        options.requester(),
        None,
        None,
    );
    coordinator.enqueue(channel, request).await.map_err(|e| e.to_string())
}

/// Search for `query`, download the first match and play it.
/// The downloaded file is removed when its playback ends.
pub async fn play_query(
    coordinator: &PlaybackCoordinator,
    resolver: &Arc<dyn MediaResolver>,
    channel: &ChannelId,
    query: &str,
    options: &PlayOptions,
) -> Result<EnqueueOutcome, String> {
    let query = query.trim();
    if query.is_empty() {
        return Err("Send a song name or URL".to_string());
    }
    // Fail before spending time on a download
    coordinator.destination(channel).map_err(|e| e.to_string())?;

    let want_video = options.video.unwrap_or(false);
    let media = resolver
        .resolve(query, want_video)
        .await
        .map_err(|e| format!("Failed to download: {e}"))?;

    let title = options.title_or(|| media.title.clone());
    let request = build_request(
        title,
        display_duration(media.duration_secs),
        media.path.to_string_lossy().into_owned(),
        want_video,
        options.requester(),
        media.thumbnail_url.clone(),
        Some(media.path.clone()),
    );
    coordinator.enqueue(channel, request).await.map_err(|e| e.to_string())
}

pub async fn skip(coordinator: &PlaybackCoordinator, channel: &ChannelId) -> SkipOutcome {
    coordinator.skip(channel).await
}

pub async fn stop(coordinator: &PlaybackCoordinator, channel: &ChannelId) -> StopOutcome {
    coordinator.stop(channel).await
}

pub async fn queue(coordinator: &PlaybackCoordinator, channel: &ChannelId) -> QueueSnapshot {
    coordinator.snapshot(channel).await
}

fn build_request(
    title: String,
    duration: String,
    input: String,
    want_video: bool,
    requester: String,
    thumbnail_url: Option<String>,
    cleanup_path: Option<PathBuf>,
) -> PlayRequest {
    PlayRequest {
        notification: OnAirNotification {
            caption: now_playing_caption(&title, &duration, &requester),
            thumbnail_url,
        },
        title,
        duration,
        input,
        profile: EncoderProfile::from_want_video(want_video),
        requester,
        cleanup_path,
    }
}

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_supported_url(url: &str) -> bool {
    ["http://", "https://", "rtmp://", "rtmps://"]
        .iter()
        .any(|scheme| url.len() > scheme.len() && url.to_lowercase().starts_with(scheme))
}
