// Queue Item Model
// A single pending or playing media item

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use super::Destination;

/// Transcode profile used for an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncoderProfile {
    /// H.264 + AAC
    #[default]
    Video,
    /// AAC only, video dropped
    AudioOnly,
}

impl EncoderProfile {
    pub fn from_want_video(want_video: bool) -> Self {
        if want_video {
            Self::Video
        } else {
            Self::AudioOnly
        }
    }
}

/// Message sent to the channel when an item goes on air
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnAirNotification {
    pub caption: String,
    pub thumbnail_url: Option<String>,
}

/// Everything a caller supplies to enqueue an item.
/// The destination is resolved by the coordinator.
#[derive(Debug, Clone)]
pub struct PlayRequest {
    pub title: String,
    pub duration: String,
    pub input: String,
    pub profile: EncoderProfile,
    pub notification: OnAirNotification,
    pub requester: String,
    pub cleanup_path: Option<PathBuf>,
}

/// An item in a channel's playback queue. Immutable once enqueued.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: Uuid,
    pub title: String,
    pub duration: String,
    pub input: String,
    pub profile: EncoderProfile,
    pub destination: Destination,
    pub notification: OnAirNotification,
    pub requester: String,
    pub cleanup_path: Option<PathBuf>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn from_request(request: PlayRequest, destination: Destination) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: request.title,
            duration: request.duration,
            input: request.input,
            profile: request.profile,
            destination,
            notification: request.notification,
            requester: request.requester,
            cleanup_path: request.cleanup_path,
            enqueued_at: Utc::now(),
        }
    }

    pub fn summary(&self) -> QueueItemSummary {
        QueueItemSummary {
            id: self.id,
            title: self.title.clone(),
            duration: self.duration.clone(),
            requester: self.requester.clone(),
            profile: self.profile,
            enqueued_at: self.enqueued_at,
        }
    }
}

/// Display view of a queue item (no input paths, no destination)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItemSummary {
    pub id: Uuid,
    pub title: String,
    pub duration: String,
    pub requester: String,
    pub profile: EncoderProfile,
    pub enqueued_at: DateTime<Utc>,
}

/// Per-channel queue view: the playing item is not part of `pending`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub now_playing: Option<QueueItemSummary>,
    pub pending: Vec<QueueItemSummary>,
}

/// Format seconds as `M:SS`, or `H:MM:SS` past the hour
pub fn format_duration(seconds: u64) -> String {
    let (mins, secs) = (seconds / 60, seconds % 60);
    let (hours, mins) = (mins / 60, mins % 60);
    if hours > 0 {
        format!("{hours}:{mins:02}:{secs:02}")
    } else {
        format!("{mins}:{secs:02}")
    }
}

/// Display duration for an optional length; `Unknown` when absent
pub fn display_duration(seconds: Option<f64>) -> String {
    match seconds {
        Some(secs) if secs.is_finite() && secs > 0.0 => format_duration(secs.round() as u64),
        _ => "Unknown".to_string(),
    }
}

pub fn now_playing_caption(title: &str, duration: &str, requester: &str) -> String {
    format!("🎵 Now Playing: {title}\n⏱️ Duration: {duration}\n👤 Requested by: {requester}")
}
