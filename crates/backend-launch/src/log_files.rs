//! On-disk logs for backend output.
//!
//! Each server start writes to `<dir>/<name>.log`. The previous log is
//! renamed to `<name>_<timestamp>.log` first and the oldest rotated files are
//! deleted so at most `max_files` remain.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::Utc;
use log::{info, warn};
use regex::Regex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

/// Number of rotated backend logs kept by default.
pub const DEFAULT_MAX_LOG_FILES: usize = 50;

/// Remove ANSI escape sequences (colours, cursor movement) from a line.
pub fn strip_ansi(line: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").expect("valid ANSI regex")
    });
    re.replace_all(line, "").into_owned()
}

/// Rotate `<dir>/<name>.log` out of the way, keeping at most `max_files` old logs.
///
/// Does nothing when the directory or the current log does not exist.
pub fn rotate_log_files(dir: &Path, name: &str, max_files: usize) -> std::io::Result<()> {
    let current = dir.join(format!("{}.log", name));
    if !current.exists() {
        return Ok(());
    }

    let prefix = format!("{}_", name);
    let mut rotated: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix) && n.ends_with(".log"))
                .unwrap_or(false)
        })
        .collect();
    rotated.sort();

    // Make room for the file about to be rotated in.
    let keep = max_files.saturating_sub(1);
    if rotated.len() > keep {
        let excess = rotated.len() - keep;
        for old in rotated.drain(..excess) {
            if let Err(e) = fs::remove_file(&old) {
                warn!("[logs] Failed to remove old log {:?}: {}", old, e);
            }
        }
    }

    if max_files == 0 {
        return fs::remove_file(&current);
    }

    let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ");
    let target = dir.join(format!("{}{}.log", prefix, timestamp));
    fs::rename(&current, &target)?;
    info!("[logs] Rotated {:?} -> {:?}", current, target);
    Ok(())
}

/// Append-only line log shared between the stdout and stderr readers.
pub struct ServerLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl ServerLog {
    /// Rotate previous logs, then open a fresh `<dir>/<name>.log`.
    pub async fn create(dir: &Path, name: &str, max_files: usize) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let rotate_dir = dir.to_path_buf();
        let rotate_name = name.to_string();
        tokio::task::spawn_blocking(move || rotate_log_files(&rotate_dir, &rotate_name, max_files))
            .await
            .map_err(std::io::Error::other)??;

        let path = dir.join(format!("{}.log", name));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_line(&self, line: &str) {
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!("[logs] Failed to write to {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rotated_count(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("backend_"))
            .count()
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[32mgreen\x1b[0m text"), "green text");
        assert_eq!(strip_ansi("plain"), "plain");
        assert_eq!(strip_ansi("\x1b[2K\x1b[1Gprogress 50%"), "progress 50%");
    }

    #[test]
    fn test_rotate_without_current_log_is_noop() {
        let dir = TempDir::new().unwrap();
        rotate_log_files(dir.path(), "backend", 5).unwrap();
        assert_eq!(rotated_count(dir.path()), 0);
    }

    #[test]
    fn test_rotate_moves_current_log() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("backend.log"), "old").unwrap();

        rotate_log_files(dir.path(), "backend", 5).unwrap();

        assert!(!dir.path().join("backend.log").exists());
        assert_eq!(rotated_count(dir.path()), 1);
    }

    #[test]
    fn test_rotate_caps_retained_files() {
        let dir = TempDir::new().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("backend_2020-01-0{}.log", i + 1)), "x").unwrap();
        }
        fs::write(dir.path().join("backend.log"), "current").unwrap();

        rotate_log_files(dir.path(), "backend", 3).unwrap();

        assert_eq!(rotated_count(dir.path()), 3);
        // Oldest files go first
        assert!(!dir.path().join("backend_2020-01-01.log").exists());
        assert!(dir.path().join("backend_2020-01-05.log").exists());
    }

    #[tokio::test]
    async fn test_server_log_writes_lines() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("backend.log"), "previous run").unwrap();

        let log = ServerLog::create(dir.path(), "backend", 5).await.unwrap();
        log.write_line("first").await;
        log.write_line("second").await;

        let content = fs::read_to_string(log.path()).unwrap();
        assert_eq!(content, "first\nsecond\n");
        assert_eq!(rotated_count(dir.path()), 1);
    }
}
