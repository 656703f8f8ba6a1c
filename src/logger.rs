// hymod/src/logger.rs

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use log::{Level, LevelFilter, Metadata, Record};

/// Log sink writing `[YYYY-MM-DD HH:MM:SS] [LEVEL] message` lines to the
/// daemon log, mirrored to stderr for interactive use.
struct DaemonLogger {
    file: Mutex<Option<File>>,
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "VERBOSE",
    }
}

impl log::Log for DaemonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{}] [{}] {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            level_name(record.level()),
            record.args()
        );
        eprintln!("{line}");
        if let Ok(mut guard) = self.file.lock()
            && let Some(file) = guard.as_mut()
        {
            let _ = writeln!(file, "{line}");
        }
    }

    fn flush(&self) {
        if let Ok(mut guard) = self.file.lock()
            && let Some(file) = guard.as_mut()
        {
            let _ = file.flush();
        }
    }
}

static LOGGER: DaemonLogger = DaemonLogger {
    file: Mutex::new(None),
};

/// Install (or re-arm) the daemon logger. Called once with CLI verbosity and
/// again after the merged config is known, mirroring the two-stage init of
/// the boot flow.
pub fn init(verbose: bool, log_path: &Path) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    if let Ok(mut guard) = LOGGER.file.lock() {
        *guard = Some(file);
    }

    let level = if verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };

    // set_logger fails on the second init; only the filter changes then.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_match_log_file_contract() {
        assert_eq!(level_name(Level::Warn), "WARN");
        assert_eq!(level_name(Level::Trace), "VERBOSE");
    }

    #[test]
    fn init_creates_parent_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("logs/daemon.log");
        init(true, &log_path).unwrap();
        log::info!("hello from test");
        log::logger().flush();
        let content = std::fs::read_to_string(&log_path).unwrap();
        assert!(content.contains("[INFO] hello from test"));
    }
}
