// Session-based log files with retention, shared by the service binary and the core.
// Logging before `init_logger` is a no-op, so library consumers and tests stay quiet.
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG: ",
            Level::Info => "",
            Level::Warn => "WARN: ",
            Level::Error => "ERROR: ",
        }
    }
}

pub struct SessionLogger {
    buffer: Mutex<Vec<String>>,
    log_path: PathBuf,
    app_name: String,
    stream_to_stdout: bool,
    min_level: Level,
}

impl SessionLogger {
    pub fn new(log_dir: &Path, app_name: &str, retention_count: usize, stream_to_stdout: bool) -> Result<Self> {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let log_path = log_dir.join(format!("{}_{}.log", app_name, timestamp));

        // Keep room for the session we are about to start
        clean_old_logs(log_dir, app_name, retention_count.saturating_sub(1));

        let logger = Self {
            buffer: Mutex::new(Vec::new()),
            log_path,
            app_name: app_name.to_string(),
            stream_to_stdout,
            min_level: if stream_to_stdout { Level::Debug } else { Level::Info },
        };
        logger.write(Level::Info, format!("=== {} Session Started ===", app_name));

        Ok(logger)
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn write(&self, level: Level, message: impl AsRef<str>) {
        if level < self.min_level {
            return;
        }

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!("[{}] {}{}", timestamp, level.tag(), message.as_ref());

        if self.stream_to_stdout {
            println!("{}", line);
            let _ = self.append_lines(std::slice::from_ref(&line));
        } else {
            self.buffer.lock().push(line);
        }
    }

    fn append_lines(&self, lines: &[String]) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        for line in lines {
            writeln!(file, "{}", line)?;
        }
        file.flush()?;
        Ok(())
    }

    pub fn flush_to_disk(&self) -> Result<()> {
        let mut buffer = self.buffer.lock();
        if buffer.is_empty() {
            return Ok(());
        }
        self.append_lines(&buffer)?;
        buffer.clear();
        Ok(())
    }

    pub fn finalize(&self) -> Result<()> {
        self.write(Level::Info, format!("=== {} Session Ended ===", self.app_name));
        self.flush_to_disk()
    }
}

/// Removes all but the `keep` newest `<app_name>_*.log` files in `log_dir`.
fn clean_old_logs(log_dir: &Path, app_name: &str, keep: usize) {
    let prefix = format!("{}_", app_name);
    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();

    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("log") {
                continue;
            }
            let matches_app = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix))
                .unwrap_or(false);
            if !matches_app {
                continue;
            }
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                log_files.push((path, modified));
            }
        }
    }

    log_files.sort_by(|a, b| b.1.cmp(&a.1));
    for (path, _) in log_files.iter().skip(keep) {
        let _ = fs::remove_file(path);
    }
}

static LOGGER: once_cell::sync::OnceCell<SessionLogger> = once_cell::sync::OnceCell::new();

pub fn init_logger(log_dir: &Path, app_name: &str, retention_count: usize, stream_to_stdout: bool) -> Result<()> {
    let logger = SessionLogger::new(log_dir, app_name, retention_count, stream_to_stdout)?;
    LOGGER.set(logger).map_err(|_| anyhow::anyhow!("Logger already initialized"))?;
    Ok(())
}

pub fn log(level: Level, message: impl AsRef<str>) {
    if let Some(logger) = LOGGER.get() {
        logger.write(level, message);
    }
}

pub fn finalize_logs() -> Result<()> {
    if let Some(logger) = LOGGER.get() {
        logger.finalize()?;
    }
    Ok(())
}

pub fn get_log_path() -> Option<PathBuf> {
    LOGGER.get().map(|logger| logger.log_path.clone())
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::Level::Debug, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::Level::Info, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::Level::Warn, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::Level::Error, format!($($arg)*))
    };
}
