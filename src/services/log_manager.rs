// LogManager Service
// Rotation, retention and tail reading for the server log

use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const SERVER_LOG_FILE: &str = "queuecast-server.log";
const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Move an oversized server log aside as `queuecast-server-<timestamp>.log`.
/// Returns the archived path when a rotation happened.
pub fn rotate_log(log_dir: &Path) -> Result<Option<PathBuf>, String> {
    let current = log_dir.join(SERVER_LOG_FILE);
    let size = match fs::metadata(&current) {
        Ok(metadata) => metadata.len(),
        Err(_) => return Ok(None),
    };
    if size < MAX_LOG_BYTES {
        return Ok(None);
    }

    let archived = log_dir.join(format!("queuecast-server-{}.log", Local::now().format("%Y%m%d-%H%M%S")));
    fs::rename(&current, &archived).map_err(|e| format!("Failed to rotate log: {e}"))?;
    Ok(Some(archived))
}

/// Delete archived `.log` files older than `retention_days` (0 keeps everything).
/// The active server log is never removed.
pub fn prune_logs(log_dir: &Path, retention_days: u32) -> Result<usize, String> {
    if retention_days == 0 || !log_dir.exists() {
        return Ok(0);
    }

    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    for (path, modified) in log_files(log_dir)? {
        if path.file_name().and_then(|n| n.to_str()) == Some(SERVER_LOG_FILE) {
            continue;
        }
        if modified < cutoff && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Last `max_lines` non-empty lines of the active server log
pub fn read_recent_logs(log_dir: &Path, max_lines: usize) -> Result<Vec<String>, String> {
    let path = log_dir.join(SERVER_LOG_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let bytes = fs::read(&path).map_err(|e| format!("Failed to read log file: {e}"))?;
    let content = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = content.lines().filter(|line| !line.trim().is_empty()).collect();

    let start = lines.len().saturating_sub(max_lines);
    Ok(lines[start..].iter().map(|line| line.to_string()).collect())
}

fn log_files(log_dir: &Path) -> Result<Vec<(PathBuf, SystemTime)>, String> {
    let entries = fs::read_dir(log_dir).map_err(|e| format!("Failed to read log dir: {e}"))?;
    Ok(entries
        .flatten()
        .filter(|entry| entry.path().extension().and_then(|ext| ext.to_str()) == Some("log"))
        .map(|entry| {
            let modified = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect())
}
