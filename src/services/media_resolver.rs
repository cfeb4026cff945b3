// Media Resolver
// Turns a search query or page URL into a local media file via yt-dlp

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

const SEARCH_PREFIX: &str = "ytsearch1";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("yt-dlp binary not found")]
    ToolNotFound,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No results found")]
    NotFound,

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Download timed out")]
    Timeout,

    #[error("Unexpected yt-dlp output: {0}")]
    InvalidOutput(String),
}

/// A downloaded media file and its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMedia {
    pub path: PathBuf,
    pub title: String,
    pub duration_secs: Option<f64>,
    pub thumbnail_url: Option<String>,
}

#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Download the first match for `query`. Audio-only requests are extracted to mp3.
    async fn resolve(&self, query: &str, want_video: bool) -> Result<ResolvedMedia, ResolveError>;
}

#[derive(Debug, Deserialize)]
struct PrintedInfo {
    filepath: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
}

/// Resolves media by running yt-dlp
pub struct YtDlpResolver {
    binary: Option<PathBuf>,
    download_dir: PathBuf,
    cookies_file: Option<PathBuf>,
}

impl YtDlpResolver {
    pub fn new(binary: Option<PathBuf>, download_dir: impl Into<PathBuf>, cookies_file: Option<PathBuf>) -> Self {
        Self {
            binary,
            download_dir: download_dir.into(),
            cookies_file,
        }
    }

    pub fn build_args(&self, query: &str, want_video: bool) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--no-playlist".into(),
            "--default-search".into(),
            SEARCH_PREFIX.into(),
            "--no-warnings".into(),
            "--no-progress".into(),
            "--no-simulate".into(),
        ];

        if want_video {
            args.extend(
                [
                    "-f",
                    "bestvideo[height<=720]+bestaudio/best[height<=720]/best",
                    "--merge-output-format",
                    "mp4",
                ]
                .map(String::from),
            );
        } else {
            args.extend(
                ["-f", "bestaudio/best", "-x", "--audio-format", "mp3", "--audio-quality", "320K"].map(String::from),
            );
        }

        // Each request owns its file, so one item's cleanup never removes another's media
        let template = self
            .download_dir
            .join(format!("%(id)s-{}.%(ext)s", Uuid::new_v4().simple()));
        args.push("-o".into());
        args.push(template.to_string_lossy().into_owned());

        if let Some(cookies) = self.cookies_file.as_ref().filter(|path| path.is_file()) {
            args.push("--cookies".into());
            args.push(cookies.to_string_lossy().into_owned());
        }

        args.push("--print".into());
        args.push("after_move:%(.{filepath,title,duration,thumbnail})j".into());
        args.push("--".into());
        args.push(query.to_string());
        args
    }

    /// Parse the first printed JSON line
    pub fn parse_output(stdout: &str) -> Result<ResolvedMedia, ResolveError> {
        let line = stdout
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with('{'))
            .ok_or(ResolveError::NotFound)?;

        let info: PrintedInfo =
            serde_json::from_str(line).map_err(|e| ResolveError::InvalidOutput(e.to_string()))?;
        let path = info
            .filepath
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ResolveError::InvalidOutput("missing filepath".to_string()))?;

        Ok(ResolvedMedia {
            path: PathBuf::from(path),
            title: info.title.unwrap_or_else(|| "Unknown".to_string()),
            duration_secs: info.duration,
            thumbnail_url: info.thumbnail.filter(|t| !t.is_empty()),
        })
    }

    fn last_error_line(stderr: &str) -> String {
        stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| line.trim_start_matches("ERROR:").trim().to_string())
            .unwrap_or_else(|| "yt-dlp exited with an error".to_string())
    }

    fn ensure_download_dir(dir: &Path) -> Result<(), ResolveError> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[async_trait]
impl MediaResolver for YtDlpResolver {
    async fn resolve(&self, query: &str, want_video: bool) -> Result<ResolvedMedia, ResolveError> {
        let binary = self.binary.as_ref().ok_or(ResolveError::ToolNotFound)?;
        Self::ensure_download_dir(&self.download_dir)?;

        log::info!("Resolving media for query: {query}");
        let mut cmd = Command::new(binary);
        cmd.args(self.build_args(query, want_video))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let output = tokio::time::timeout(DOWNLOAD_TIMEOUT, cmd.output())
            .await
            .map_err(|_| ResolveError::Timeout)??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = Self::last_error_line(&stderr);
            log::warn!("yt-dlp failed for query {query:?}: {reason}");
            return Err(ResolveError::DownloadFailed(reason));
        }

        let media = Self::parse_output(&String::from_utf8_lossy(&output.stdout))?;
        log::info!("Downloaded \"{}\" to {}", media.title, media.path.display());
        Ok(media)
    }
}
