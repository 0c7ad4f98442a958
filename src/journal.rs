use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::types::Offset;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// Append-only record of every recovery attempt, outcome, and diagnostic.
/// Each entry is written and synced before `record` returns, so a crash
/// mid-scan leaves the log consistent up to the last recorded event. There
/// is no deletion or mutation API.
pub struct Journal {
    file: Mutex<File>,
    path: PathBuf,
}

impl Journal {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line: `<timestamp> <SEVERITY> <message> [offset=N]`.
    /// Best-effort on I/O failure; the scan outlives its log.
    pub fn record(&self, severity: Severity, message: &str, related_offset: Option<Offset>) {
        match severity {
            Severity::Info => tracing::info!(offset = related_offset, "{}", message),
            Severity::Warning => tracing::warn!(offset = related_offset, "{}", message),
            Severity::Error => tracing::error!(offset = related_offset, "{}", message),
        }

        let ts = unix_now();
        let mut file = self.file.lock();
        let result = match related_offset {
            Some(offset) => writeln!(file, "{} {} {} offset={}", ts, severity, message, offset),
            None => writeln!(file, "{} {} {}", ts, severity, message),
        }
        .and_then(|_| file.flush())
        .and_then(|_| file.sync_data());

        if let Err(e) = result {
            tracing::error!(error = %e, "failed to append to recovery log");
        }
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
