//! Sinks that persist canonical error records

use crate::diagnostics::record::{CanonicalErrorRecord, Severity};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A destination for error records
pub trait ErrorLogger: Send + Sync {
    fn name(&self) -> &'static str;

    fn log(&self, record: &CanonicalErrorRecord) -> Result<(), LoggerError>;
}

/// Emits one structured tracing event per record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorLogger;

impl ErrorLogger for TracingErrorLogger {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn log(&self, record: &CanonicalErrorRecord) -> Result<(), LoggerError> {
        let id = record.id.to_string();
        let fingerprint = record.fingerprint.as_ref();
        match record.severity {
            Severity::Info => info!(
                error_id = %id,
                error_type = %record.error_type,
                fingerprint,
                "{}",
                record.message
            ),
            Severity::Warning => warn!(
                error_id = %id,
                error_type = %record.error_type,
                fingerprint,
                "{}",
                record.message
            ),
            Severity::Error | Severity::Critical => error!(
                error_id = %id,
                error_type = %record.error_type,
                severity = %record.severity,
                fingerprint,
                detail = record.detail.as_deref().unwrap_or_default(),
                "{}",
                record.message
            ),
        }
        Ok(())
    }
}

/// Appends each record as one JSON line
pub struct JsonLinesErrorLogger {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesErrorLogger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LoggerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ErrorLogger for JsonLinesErrorLogger {
    fn name(&self) -> &'static str {
        "json-lines"
    }

    fn log(&self, record: &CanonicalErrorRecord) -> Result<(), LoggerError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::record::{ErrorInfo, ErrorType};
    use chrono::Utc;

    #[test]
    fn test_json_lines_logger_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/errors.jsonl");
        let logger = JsonLinesErrorLogger::open(&path).unwrap();

        for message in ["first", "second"] {
            let record = CanonicalErrorRecord::from_info(
                ErrorInfo::new(ErrorType::File, Severity::Error, message),
                Utc::now(),
            );
            logger.log(&record).unwrap();
        }

        let contents = std::fs::read_to_string(logger.path()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed["message"], "second");
        assert_eq!(parsed["type"], "file");
    }

    #[test]
    fn test_tracing_logger_never_fails() {
        let record = CanonicalErrorRecord::from_info(
            ErrorInfo::new(ErrorType::Unknown, Severity::Info, "quiet"),
            Utc::now(),
        );
        assert!(TracingErrorLogger.log(&record).is_ok());
    }
}
