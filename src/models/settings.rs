// Settings Model
// Application-wide configuration

use serde::{Deserialize, Serialize};

fn default_rtmp_base_url() -> String {
    "rtmps://dc5-1.rtmp.t.me/s/".to_string()
}

fn default_ffmpeg_path() -> String {
    String::new()
}

fn default_yt_dlp_path() -> String {
    String::new()
}

fn default_download_dir() -> String {
    "data/downloads".to_string()
}

fn default_media_dir() -> String {
    "data/media".to_string()
}

fn default_stop_grace_seconds() -> u64 {
    10
}

fn default_log_retention_days() -> u32 {
    30
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_port() -> u16 {
    8008
}

fn default_webhook_username() -> String {
    "QueueCast".to_string()
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    // Destination
    #[serde(default = "default_rtmp_base_url")]
    pub rtmp_base_url: String,

    // External tools (empty = look up on PATH)
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_yt_dlp_path")]
    pub yt_dlp_path: String,
    #[serde(default)]
    pub cookies_file: String,

    // Media storage
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
    #[serde(default = "default_media_dir")]
    pub media_dir: String,

    // Encoder supervision
    #[serde(default = "default_stop_grace_seconds")]
    pub stop_grace_seconds: u64,

    // Log retention
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,

    // Local host server (HTTP/WS)
    #[serde(default = "default_backend_host")]
    pub backend_host: String,
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
    #[serde(default)]
    pub backend_token: String,

    // Webhook notifications (empty = events only)
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default = "default_webhook_username")]
    pub webhook_username: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rtmp_base_url: default_rtmp_base_url(),
            ffmpeg_path: default_ffmpeg_path(),
            yt_dlp_path: default_yt_dlp_path(),
            cookies_file: String::new(),
            download_dir: default_download_dir(),
            media_dir: default_media_dir(),
            stop_grace_seconds: default_stop_grace_seconds(),
            log_retention_days: default_log_retention_days(),
            backend_host: default_backend_host(),
            backend_port: default_backend_port(),
            backend_token: String::new(),
            webhook_url: String::new(),
            webhook_username: default_webhook_username(),
        }
    }
}
