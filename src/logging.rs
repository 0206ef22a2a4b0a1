use chrono::Local;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::clienv;

const PANEL_LOG_FILE: &str = "panel.log";
const DEFAULT_FILTER: &str = "peresvet=info,warn";

/// Install the global subscriber: compact stderr output plus `userdata/logs/panel.log`.
///
/// The returned guard flushes the file writer and must live until exit.
pub fn init_tracing(log_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    let filter = clienv::log_filter()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| {
            EnvFilter::new(if verbose {
                "peresvet=debug,info"
            } else {
                DEFAULT_FILTER
            })
        });

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let (file_layer, guard) = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::never(log_dir, PANEL_LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .compact();
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!("Failed to create log directory {}: {}", log_dir.display(), e);
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .ok();

    guard
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventLevel::Info => "INFO",
            EventLevel::Warn => "WARN",
            EventLevel::Error => "ERROR",
        })
    }
}

/// Aggregate start/stop/failure log (`userdata/logs/server.log`), one
/// `timestamp | LEVEL | component | message` line per event.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, component: impl fmt::Display, message: impl AsRef<str>) {
        self.record(EventLevel::Info, component, message.as_ref());
    }

    pub fn warn(&self, component: impl fmt::Display, message: impl AsRef<str>) {
        self.record(EventLevel::Warn, component, message.as_ref());
    }

    pub fn error(&self, component: impl fmt::Display, message: impl AsRef<str>) {
        self.record(EventLevel::Error, component, message.as_ref());
    }

    pub fn record(&self, level: EventLevel, component: impl fmt::Display, message: &str) {
        match level {
            EventLevel::Info => tracing::info!(component = %component, "{}", message),
            EventLevel::Warn => tracing::warn!(component = %component, "{}", message),
            EventLevel::Error => tracing::error!(component = %component, "{}", message),
        }

        let line = format!(
            "{} | {} | {} | {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            level,
            component,
            message.replace('\n', " ")
        );

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let written = self
            .path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&self.path))
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = written {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to write event log");
        }
    }

    /// Last `count` lines of the log, oldest first.
    pub fn tail(&self, count: usize) -> Vec<String> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let lines: Vec<&str> = content.lines().collect();
        lines[lines.len().saturating_sub(count)..]
            .iter()
            .map(|l| l.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleKind;

    #[test]
    fn event_lines_are_pipe_separated() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("logs/server.log"));

        log.info(ModuleKind::Php, "started (pid 42)");
        log.error("stack", "startup failed\nat nginx");

        let lines = log.tail(10);
        assert_eq!(lines.len(), 2);
        let fields: Vec<&str> = lines[0].split(" | ").collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[1], "INFO");
        assert_eq!(fields[2], "php");
        assert_eq!(fields[3], "started (pid 42)");
        assert!(lines[1].ends_with("| ERROR | stack | startup failed at nginx"));
    }

    #[test]
    fn tail_limits_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("server.log"));
        for i in 0..5 {
            log.info("stack", format!("event {}", i));
        }
        let lines = log.tail(2);
        assert!(lines[0].ends_with("event 3"));
        assert!(lines[1].ends_with("event 4"));
        assert!(EventLog::new(dir.path().join("missing.log")).tail(3).is_empty());
    }
}
