//! Per-store diagnostic log with size-capped rotation.
//!
//! Lines go to `<path>/litecask.log` and are forwarded to `tracing` at the
//! same level. When the active log exceeds its size cap it is rotated to
//! `litecask1.log` .. `litecask5.log`, the oldest beyond that being deleted.
//! Rotation is checked when the sink is attached and by the upkeep thread.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Number of rotated log generations kept on disk.
const LOG_ROTATION_DEPTH: u32 = 5;

/// Default size cap of the active log file.
const DEFAULT_MAX_LOG_FILE_BYTES: u64 = 10_000_000;

/// Severity of a store log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Debug => "[debug]",
            LogLevel::Info => "[info ]",
            LogLevel::Warn => "[warn ]",
            LogLevel::Error => "[error]",
        }
    }
}

#[derive(Debug, Default)]
struct Sink {
    dir: Option<PathBuf>,
    file: Option<File>,
    max_file_bytes: u64,
}

/// Rotating per-store log sink.
#[derive(Debug)]
pub struct StoreLogger {
    sink: Mutex<Sink>,
    level: AtomicU8,
}

impl StoreLogger {
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(Sink {
                dir: None,
                file: None,
                max_file_bytes: DEFAULT_MAX_LOG_FILE_BYTES,
            }),
            level: AtomicU8::new(LogLevel::Info as u8),
        }
    }

    /// Minimum level written to the log file.
    pub fn set_level(&self, level: LogLevel) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    /// Overrides the rotation size cap (test hook).
    pub fn set_max_file_bytes(&self, max_file_bytes: u64) {
        self.sink.lock().max_file_bytes = max_file_bytes;
    }

    /// Attaches the sink to a store directory, rotating an oversized log.
    pub fn attach(&self, dir: &Path) {
        let mut sink = self.sink.lock();
        sink.dir = Some(dir.to_path_buf());
        sink.file = None;
        let max = sink.max_file_bytes;
        rotate_if_oversized(dir, max);
    }

    /// Closes the sink, e.g. when the store closes.
    pub fn detach(&self) {
        let mut sink = self.sink.lock();
        sink.file = None;
        sink.dir = None;
    }

    /// Rotation check performed by the upkeep thread.
    pub fn rotate_if_needed(&self) {
        let mut sink = self.sink.lock();
        let Some(dir) = sink.dir.clone() else {
            return;
        };
        let active = dir.join(log_file_name(0));
        let size = std::fs::metadata(&active).map(|m| m.len()).unwrap_or(0);
        if size > sink.max_file_bytes {
            sink.file = None;
            rotate_if_oversized(&dir, sink.max_file_bytes);
        }
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(target: "litecask", "{message}");
        self.write_line(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!(target: "litecask", "{message}");
        self.write_line(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(target: "litecask", "{message}");
        self.write_line(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(target: "litecask", "{message}");
        self.write_line(LogLevel::Error, message);
    }

    fn write_line(&self, level: LogLevel, message: &str) {
        if (level as u8) < self.level.load(Ordering::Relaxed) {
            return;
        }
        let mut sink = self.sink.lock();
        let Some(dir) = sink.dir.clone() else {
            return;
        };
        if sink.file.is_none() {
            sink.file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(log_file_name(0)))
                .ok();
        }
        let Some(file) = sink.file.as_mut() else {
            return;
        };
        let stamp = unix_millis();
        let line = format!(
            "[{}.{:03}] {} {}\n",
            stamp / 1000,
            stamp % 1000,
            level.tag(),
            message
        );
        if file.write_all(line.as_bytes()).is_err() {
            sink.file = None;
        }
    }
}

impl Default for StoreLogger {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `litecask.log` for generation 0, `litecask<N>.log` beyond.
fn log_file_name(generation: u32) -> String {
    if generation == 0 {
        "litecask.log".to_string()
    } else {
        format!("litecask{generation}.log")
    }
}

fn rotate_if_oversized(dir: &Path, max_file_bytes: u64) {
    let active = dir.join(log_file_name(0));
    let size = std::fs::metadata(&active).map(|m| m.len()).unwrap_or(0);
    if size <= max_file_bytes {
        return;
    }
    // Shift generations up, dropping the oldest. Failures are ignored on
    // purpose: the files may not exist yet.
    let _ = std::fs::remove_file(dir.join(log_file_name(LOG_ROTATION_DEPTH)));
    for generation in (0..LOG_ROTATION_DEPTH).rev() {
        let _ = std::fs::rename(
            dir.join(log_file_name(generation)),
            dir.join(log_file_name(generation + 1)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_to_active_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = StoreLogger::new();
        logger.attach(dir.path());
        logger.info("store opened");
        logger.warn("something odd");
        logger.detach();

        let content =
            std::fs::read_to_string(dir.path().join("litecask.log")).expect("log file exists");
        assert!(content.contains("[info ] store opened"));
        assert!(content.contains("[warn ] something odd"));
    }

    #[test]
    fn test_level_filtering() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = StoreLogger::new();
        logger.attach(dir.path());
        logger.set_level(LogLevel::Warn);
        logger.info("filtered out");
        logger.error("kept");
        logger.detach();

        let content =
            std::fs::read_to_string(dir.path().join("litecask.log")).expect("log file exists");
        assert!(!content.contains("filtered out"));
        assert!(content.contains("kept"));
    }

    #[test]
    fn test_rotation_shifts_generations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = StoreLogger::new();
        logger.set_max_file_bytes(64);
        logger.attach(dir.path());
        logger.info("first generation content that easily exceeds sixty four bytes in a line");
        logger.rotate_if_needed();
        logger.info("second generation");
        logger.detach();

        let rotated =
            std::fs::read_to_string(dir.path().join("litecask1.log")).expect("rotated file");
        assert!(rotated.contains("first generation"));
        let active =
            std::fs::read_to_string(dir.path().join("litecask.log")).expect("active file");
        assert!(active.contains("second generation"));
    }
}
