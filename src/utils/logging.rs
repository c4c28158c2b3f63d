//! Logging Utilities
//!
//! File-based and console logging.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Get the log file path
pub fn get_log_file_path() -> PathBuf {
    super::get_app_data_dir().join("studio.log")
}

/// Simple file logger
pub struct FileLogger {
    file: Mutex<Option<File>>,
    console: bool,
}

impl FileLogger {
    pub fn new(console: bool) -> Self {
        let file = Self::open_log_file();
        Self {
            file: Mutex::new(file),
            console,
        }
    }

    fn open_log_file() -> Option<File> {
        let path = get_log_file_path();

        // Ensure directory exists
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok()
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let target = metadata.target();
        let level = metadata.level();

        // Keep the per-tick path quiet: our crate logs DEBUG and above,
        // external crates are restricted to WARN so FFmpeg and driver
        // wrappers cannot flood the log at frame rate.
        if target.starts_with("vr360_studio") {
            level <= Level::Debug
        } else {
            level <= Level::Warn
        }
    }

    fn log(&self, record: &Record) {
        let target = record.target();
        let level = record.level();

        if !target.starts_with("vr360_studio") && level > Level::Warn {
            return;
        }

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!("[{}] {} {} - {}\n", timestamp, level, target, record.args());

        // Write to file
        if let Ok(mut guard) = self.file.lock() {
            if let Some(ref mut file) = *guard {
                let _ = file.write_all(line.as_bytes());
            }
        }

        // Write to console if enabled
        if self.console {
            print!("{}", line);
        }
    }

    fn flush(&self) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(ref mut file) = *guard {
                let _ = file.flush();
            }
        }
    }
}

/// Initialize file logging.
///
/// Console output is disabled by default: blocking console I/O in the tick
/// loop costs frames. Everything still lands in the log file.
pub fn init_logging() -> Result<(), log::SetLoggerError> {
    let logger = Box::new(FileLogger::new(false));
    log::set_boxed_logger(logger)?;
    log::set_max_level(LevelFilter::Debug);
    Ok(())
}

/// Initialize console logging through `env_logger` (respects `RUST_LOG`),
/// for development runs
pub fn init_console_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Clear log file
pub fn clear_logs() -> std::io::Result<()> {
    let path = get_log_file_path();
    if path.exists() {
        std::fs::write(&path, "")?;
    }
    Ok(())
}
