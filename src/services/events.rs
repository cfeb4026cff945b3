// Playback Events
// Fire-and-forget event fan-out for WebSocket subscribers

use serde::Serialize;
use serde_json::Value;

pub const EVENT_PLAYBACK_STARTED: &str = "playback_started";
pub const EVENT_PLAYBACK_QUEUED: &str = "playback_queued";
pub const EVENT_PLAYBACK_ENDED: &str = "playback_ended";
pub const EVENT_PLAYBACK_FAILED: &str = "playback_failed";
pub const EVENT_PLAYBACK_SKIPPED: &str = "playback_skipped";
pub const EVENT_PLAYBACK_STOPPED: &str = "playback_stopped";
pub const EVENT_NOTIFICATION: &str = "notification";

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value);
}

pub fn emit_event<T: Serialize>(sink: &dyn EventSink, event: &str, payload: &T) {
    match serde_json::to_value(payload) {
        Ok(value) => sink.emit(event, value),
        Err(e) => log::warn!("Dropping {event} event: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::RecordingEventSink;

    #[test]
    fn test_emit_event_serializes_payload() {
        let sink = RecordingEventSink::default();
        emit_event(&sink, EVENT_PLAYBACK_STOPPED, &serde_json::json!({ "channelId": "42" }));
        assert_eq!(sink.names(), vec![EVENT_PLAYBACK_STOPPED.to_string()]);
    }
}
