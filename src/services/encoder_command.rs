// Encoder Command Builder
// Builds FFmpeg invocations for the fixed transcode profiles

use crate::models::{redact_rtmp_url, Destination, EncoderProfile};

const VIDEO_BITRATE: &str = "1500k";
const VIDEO_BUFSIZE: &str = "3000k";
const GOP_SIZE: &str = "25";
const OUTPUT_WIDTH: u32 = 1280;
const OUTPUT_HEIGHT: u32 = 720;
const AUDIO_BITRATE: &str = "96k";
const AUDIO_CHANNELS: &str = "2";
const AUDIO_SAMPLE_RATE: &str = "44100";

/// A fully resolved encoder invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EncoderCommand {
    /// Command line safe for logs (stream key redacted)
    pub fn redacted(&self) -> String {
        let args: Vec<String> = self.args.iter().map(|arg| redact_rtmp_url(arg)).collect();
        format!("{} {}", self.program, args.join(" "))
    }

    /// The output URL (last argument)
    pub fn output(&self) -> Option<&str> {
        self.args.last().map(String::as_str)
    }
}

/// Deterministic, side-effect free builder
#[derive(Debug, Clone)]
pub struct EncoderCommandBuilder {
    ffmpeg_path: String,
}

impl EncoderCommandBuilder {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    pub fn build(&self, profile: EncoderProfile, input: &str, destination: &Destination) -> EncoderCommand {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];

        if Self::is_network_input(input) {
            // Keep pulling a remote input through short network hiccups
            args.extend(
                ["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "5"]
                    .map(String::from),
            );
        }

        // Read input at native rate so the destination receives a live stream
        args.push("-re".into());
        args.push("-i".into());
        args.push(input.to_string());

        match profile {
            EncoderProfile::Video => Self::append_video_args(&mut args),
            EncoderProfile::AudioOnly => args.push("-vn".into()),
        }
        Self::append_audio_args(&mut args);

        args.push("-f".into());
        args.push("flv".into());
        args.push(destination.as_url().to_string());

        EncoderCommand {
            program: self.ffmpeg_path.clone(),
            args,
        }
    }

    fn is_network_input(input: &str) -> bool {
        input.starts_with("http://") || input.starts_with("https://")
    }

    fn append_video_args(args: &mut Vec<String>) {
        let scale = format!(
            "scale={OUTPUT_WIDTH}:{OUTPUT_HEIGHT}:force_original_aspect_ratio=decrease,\
             pad={OUTPUT_WIDTH}:{OUTPUT_HEIGHT}:(ow-iw)/2:(oh-ih)/2"
        );
        args.extend(
            [
                "-c:v", "libx264",
                "-preset", "fast",
                "-b:v", VIDEO_BITRATE,
                "-maxrate", VIDEO_BITRATE,
                "-bufsize", VIDEO_BUFSIZE,
                "-pix_fmt", "yuv420p",
                "-vf", scale.as_str(),
                "-g", GOP_SIZE,
                "-keyint_min", GOP_SIZE,
                "-sc_threshold", "0",
            ]
            .map(String::from),
        );
    }

    fn append_audio_args(args: &mut Vec<String>) {
        args.extend(
            [
                "-c:a", "aac",
                "-b:a", AUDIO_BITRATE,
                "-ac", AUDIO_CHANNELS,
                "-ar", AUDIO_SAMPLE_RATE,
            ]
            .map(String::from),
        );
    }
}
