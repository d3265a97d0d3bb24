use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

/// Severity of a single run-log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// One timestamped, leveled message in a run's record.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

struct LogInner {
    entries: Vec<LogEntry>,
    file: Option<File>,
    path: Option<PathBuf>,
}

/// Append-only, ordered message record for one workflow execution.
///
/// Cloning shares the underlying record: a nested engine logs through a
/// `with_prefix` clone so its lines land in the parent's single stream,
/// attributed to the sub-workflow. Entries are mirrored to a per-run text
/// file when one could be opened; file trouble never fails a run.
#[derive(Clone)]
pub struct RunLog {
    inner: Arc<Mutex<LogInner>>,
    prefix: Option<String>,
}

impl RunLog {
    /// A log with no backing file.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                entries: Vec::new(),
                file: None,
                path: None,
            })),
            prefix: None,
        }
    }

    /// A log persisted to `<logs_dir>/<workflow-name>_<timestamp>.log`.
    ///
    /// Falls back to in-memory when the file cannot be created.
    pub fn create(logs_dir: &Path, workflow_name: &str) -> Self {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = logs_dir.join(format!("{}_{}.log", sanitize(workflow_name), stamp));

        let file = std::fs::create_dir_all(logs_dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));

        match file {
            Ok(f) => Self {
                inner: Arc::new(Mutex::new(LogInner {
                    entries: Vec::new(),
                    file: Some(f),
                    path: Some(path),
                })),
                prefix: None,
            },
            Err(e) => {
                warn!(error = %e, path = %path.display(), "Failed to open run log file, logging in memory only");
                Self::in_memory()
            }
        }
    }

    /// A handle onto the same record whose lines carry a bridging prefix.
    pub fn with_prefix(&self, name: &str) -> Self {
        let prefix = match &self.prefix {
            Some(existing) => format!("{}/{}", existing, name),
            None => name.to_string(),
        };
        Self {
            inner: Arc::clone(&self.inner),
            prefix: Some(prefix),
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(LogLevel::Info, message.into());
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.push(LogLevel::Warning, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(LogLevel::Error, message.into());
    }

    fn push(&self, level: LogLevel, message: String) {
        let message = match &self.prefix {
            Some(prefix) => format!("[{}] {}", prefix, message),
            None => message,
        };

        match level {
            LogLevel::Info => tracing::info!(target: "gantry::run", "{}", message),
            LogLevel::Warning => tracing::warn!(target: "gantry::run", "{}", message),
            LogLevel::Error => tracing::error!(target: "gantry::run", "{}", message),
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        };

        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(file) = inner.file.as_mut() {
            let line = format!(
                "[{}] [{}] {}\n",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                entry.level.as_str(),
                entry.message
            );
            // Flush per line so a crashed run keeps everything written so far
            if file.write_all(line.as_bytes()).and_then(|_| file.flush()).is_err() {
                inner.file = None;
            }
        }
        inner.entries.push(entry);
    }

    /// Snapshot of all entries recorded so far, in order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner
            .lock()
            .map(|inner| inner.entries.clone())
            .unwrap_or_default()
    }

    /// Path of the backing file, when one is attached.
    pub fn file_path(&self) -> Option<PathBuf> {
        self.inner.lock().ok().and_then(|inner| inner.path.clone())
    }
}

/// File-name-safe form of a workflow name.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "workflow".to_string()
    } else {
        cleaned
    }
}
