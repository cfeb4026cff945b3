// Binary Locator
// Finds external tools (ffmpeg, yt-dlp)

use std::path::PathBuf;

/// Locate `name`, checking in order:
/// 1. The configured path, when set
/// 2. Next to the server executable
/// 3. PATH
pub fn locate_binary(configured: &str, name: &str) -> Option<PathBuf> {
    let configured = configured.trim();
    if !configured.is_empty() {
        let path = PathBuf::from(configured);
        if path.is_file() {
            log::debug!("Using configured {name}: {path:?}");
            return Some(path);
        }
        log::warn!("Configured {name} path does not exist: {path:?}");
    }

    let file_name = if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    };
    if let Some(exe_dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(PathBuf::from)) {
        let sidecar = exe_dir.join(&file_name);
        if sidecar.is_file() {
            log::debug!("Found {name} next to server binary: {sidecar:?}");
            return Some(sidecar);
        }
    }

    match which::which(name) {
        Ok(path) => {
            log::debug!("Found {name} in PATH: {path:?}");
            Some(path)
        }
        Err(_) => {
            log::warn!("{name} binary not found in any location");
            None
        }
    }
}
