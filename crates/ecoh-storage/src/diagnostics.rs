//! Per-endpoint diagnostic logs.
//!
//! Every fetch and merge writes a human-readable trail scoped to the endpoint
//! (or fan-out target) name. The trail is informational only; nothing in the
//! pipeline reads it back.

use std::collections::hash_map::{Entry, HashMap};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::Local;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for DiagLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiagLevel::Debug => "DEBUG",
            DiagLevel::Info => "INFO",
            DiagLevel::Warn => "WARNING",
            DiagLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

pub trait DiagnosticSink: Send + Sync {
    fn record(&self, scope: &str, level: DiagLevel, message: &str);
}

/// Appends `<timestamp> - LEVEL - message` lines to `<dir>/<scope>_parse.log`.
/// Each scope's file is opened once and kept open for the life of the sink.
#[derive(Debug)]
pub struct FileDiagnostics {
    dir: PathBuf,
    handles: Mutex<HashMap<PathBuf, File>>,
}

impl FileDiagnostics {
    /// Creates the log directory; failing here is a startup error.
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;
        Ok(Self {
            dir,
            handles: Mutex::new(HashMap::new()),
        })
    }

    pub fn log_path(&self, scope: &str) -> PathBuf {
        let stem: String = scope
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{stem}_parse.log"))
    }
}

impl DiagnosticSink for FileDiagnostics {
    fn record(&self, scope: &str, level: DiagLevel, message: &str) {
        if level == DiagLevel::Debug {
            return;
        }
        let path = self.log_path(scope);
        let line = format!(
            "{} - {} - {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
            level,
            message
        );
        let Ok(mut handles) = self.handles.lock() else {
            tracing::warn!(path = %path.display(), "diagnostic log lock poisoned");
            return;
        };
        let file = match handles.entry(path.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map(|file| entry.insert(file)),
        };
        let written = file.and_then(|file| file.write_all(line.as_bytes()));
        if let Err(err) = written {
            tracing::warn!(path = %path.display(), error = %err, "diagnostic log write failed");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticLine {
    pub scope: String,
    pub level: DiagLevel,
    pub message: String,
}

/// Keeps every line in memory; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryDiagnostics {
    lines: Mutex<Vec<DiagnosticLine>>,
}

impl MemoryDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<DiagnosticLine> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn lines_for(&self, scope: &str) -> Vec<DiagnosticLine> {
        self.lines()
            .into_iter()
            .filter(|l| l.scope == scope)
            .collect()
    }
}

impl DiagnosticSink for MemoryDiagnostics {
    fn record(&self, scope: &str, level: DiagLevel, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(DiagnosticLine {
                scope: scope.to_string(),
                level,
                message: message.to_string(),
            });
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiagnostics;

impl DiagnosticSink for NoopDiagnostics {
    fn record(&self, _scope: &str, _level: DiagLevel, _message: &str) {}
}

/// A sink bound to one scope. Every line is mirrored as a `tracing` event.
#[derive(Clone)]
pub struct ScopedLog {
    sink: Arc<dyn DiagnosticSink>,
    scope: String,
}

impl ScopedLog {
    pub fn new(sink: Arc<dyn DiagnosticSink>, scope: impl Into<String>) -> Self {
        Self {
            sink,
            scope: scope.into(),
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::debug!(scope = %self.scope, "{message}");
        self.sink.record(&self.scope, DiagLevel::Debug, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(scope = %self.scope, "{message}");
        self.sink.record(&self.scope, DiagLevel::Info, message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::warn!(scope = %self.scope, "{message}");
        self.sink.record(&self.scope, DiagLevel::Warn, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::error!(scope = %self.scope, "{message}");
        self.sink.record(&self.scope, DiagLevel::Error, message);
    }
}

impl fmt::Debug for ScopedLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedLog").field("scope", &self.scope).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_sink_appends_per_scope() {
        let dir = tempdir().expect("tempdir");
        let sink = FileDiagnostics::open(dir.path().join("logs")).expect("open");
        sink.record("nsmos_place", DiagLevel::Info, "first");
        sink.record("nsmos_place", DiagLevel::Error, "second");
        sink.record("sg_water", DiagLevel::Warn, "other");
        sink.record("sg_water", DiagLevel::Debug, "dropped");

        let text = std::fs::read_to_string(sink.log_path("nsmos_place")).expect("read");
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("INFO - first"));
        assert!(lines[1].ends_with("ERROR - second"));

        let other = std::fs::read_to_string(sink.log_path("sg_water")).expect("read");
        assert_eq!(other.lines().count(), 1);
    }

    #[test]
    fn file_sink_opens_each_scope_once() {
        let dir = tempdir().expect("tempdir");
        let sink = FileDiagnostics::open(dir.path()).expect("open");
        for n in 0..50 {
            sink.record("sources_values_A", DiagLevel::Warn, &format!("line {n}"));
        }
        sink.record("sources_values_B", DiagLevel::Info, "other");

        assert_eq!(sink.handles.lock().expect("lock").len(), 2);
        let text = std::fs::read_to_string(sink.log_path("sources_values_A")).expect("read");
        assert_eq!(text.lines().count(), 50);
        assert!(text.lines().last().expect("last").ends_with("WARNING - line 49"));
    }

    #[test]
    fn scoped_log_routes_to_its_scope() {
        let sink = Arc::new(MemoryDiagnostics::new());
        let log = ScopedLog::new(sink.clone(), "sources_values_12");
        log.info("hello");
        log.error("boom");
        let lines = sink.lines_for("sources_values_12");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].level, DiagLevel::Error);
    }
}
