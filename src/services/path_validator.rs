// Path Validation Service
// Keeps file playback inside the media directory

use std::path::{Path, PathBuf};

/// Extensions accepted for local playback
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "mp3", "m4a", "aac", "ogg", "oga", "opus", "wav", "flac", "mp4", "mkv", "webm", "mov",
];

/// Validate that an existing path is within an allowed directory (prevents path traversal).
/// Returns the canonicalized path.
pub fn validate_path_within(path: &Path, allowed_dir: &Path) -> Result<PathBuf, String> {
    if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err("Path traversal detected: '..' not allowed".to_string());
    }

    let canonical = path.canonicalize().map_err(|e| format!("Invalid path: {e}"))?;
    let allowed_canonical = allowed_dir
        .canonicalize()
        .map_err(|e| format!("Invalid allowed directory: {e}"))?;

    if !canonical.starts_with(&allowed_canonical) {
        return Err("Path traversal detected: path outside allowed directory".to_string());
    }
    Ok(canonical)
}

pub fn validate_extension(path: &Path, allowed_extensions: &[&str]) -> Result<(), String> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .ok_or_else(|| "File must have an extension".to_string())?;

    if !allowed_extensions.contains(&extension.as_str()) {
        return Err(format!(
            "Invalid file extension '{extension}'. Allowed: {}",
            allowed_extensions.join(", ")
        ));
    }
    Ok(())
}

/// Resolve a requested media file. Relative paths are taken from `media_dir`.
pub fn resolve_media_path(requested: &str, media_dir: &Path) -> Result<PathBuf, String> {
    let requested = requested.trim();
    if requested.is_empty() {
        return Err("Path must not be empty".to_string());
    }

    let candidate = Path::new(requested);
    let candidate = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        media_dir.join(candidate)
    };

    let validated = validate_path_within(&candidate, media_dir)?;
    if !validated.is_file() {
        return Err("Not a file".to_string());
    }
    validate_extension(&validated, MEDIA_EXTENSIONS)?;
    Ok(validated)
}
