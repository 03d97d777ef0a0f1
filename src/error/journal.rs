/// Append-only error journal
///
/// One newline-delimited JSON record per classified event (not per code), so
/// the full history survives the process and can be replayed into a report.
use super::classification::{ErrorCategory, ErrorCode, ErrorEvent, RecoveryStrategy, Severity};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Append one serialized record as a single line
pub fn append_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create journal directory")?;
        }
    }

    let line = serde_json::to_string(record).context("Failed to serialize journal record")?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    writeln!(file, "{}", line).context("Failed to append journal record")?;

    Ok(())
}

/// Read every record back; a missing file reads as empty
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file =
        std::fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context("Failed to read journal line")?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("Malformed record on line {}", index + 1))?;
        records.push(record);
    }

    Ok(records)
}

/// Persisted form of an `ErrorEvent`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub timestamp: DateTime<Utc>,
    pub stack_id: Option<String>,
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub context: String,
    pub strategy: RecoveryStrategy,
    pub occurrence_count: u64,
}

impl From<&ErrorEvent> for JournalRecord {
    fn from(event: &ErrorEvent) -> Self {
        Self {
            timestamp: event.timestamp,
            stack_id: event.stack_id.clone(),
            code: event.code.clone(),
            category: event.category,
            severity: event.severity,
            context: event.context.clone(),
            strategy: event.recovery_strategy,
            occurrence_count: event.occurrence_count,
        }
    }
}

pub struct ErrorJournal {
    path: PathBuf,

    // Serializes appends from concurrent classifiers
    write_lock: Mutex<()>,
}

impl ErrorJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &ErrorEvent) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        append_record(&self.path, &JournalRecord::from(event))
    }

    pub fn read_all(&self) -> Result<Vec<JournalRecord>> {
        read_records(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn event(code: ErrorCode, count: u64) -> ErrorEvent {
        let (category, severity, strategy) = code.defaults();
        ErrorEvent {
            code,
            category,
            severity,
            context: "allocate_compute".to_string(),
            recovery_strategy: strategy,
            occurrence_count: count,
            stack_id: Some("ai-stack".to_string()),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_one_record_per_event() {
        let temp = TempDir::new().unwrap();
        let journal = ErrorJournal::new(temp.path().join("nested/errors.ndjson"));

        journal.append(&event(ErrorCode::CapacityExhausted, 1)).unwrap();
        journal.append(&event(ErrorCode::CapacityExhausted, 2)).unwrap();
        journal.append(&event(ErrorCode::OperationTimeout, 1)).unwrap();

        let records = journal.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].occurrence_count, 2);
        assert_eq!(records[2].code, ErrorCode::OperationTimeout);
        assert_eq!(records[2].strategy, RecoveryStrategy::Retry);
    }

    #[test]
    fn test_record_line_has_expected_fields() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("errors.ndjson");
        let journal = ErrorJournal::new(&path);
        journal.append(&event(ErrorCode::SpotBidTooLow, 1)).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(raw.trim()).unwrap();
        assert_eq!(value["code"], "spot-bid-too-low");
        assert_eq!(value["severity"], "warning");
        assert_eq!(value["strategy"], "fallback");
        assert_eq!(value["stack_id"], "ai-stack");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_missing_journal_reads_empty() {
        let temp = TempDir::new().unwrap();
        let journal = ErrorJournal::new(temp.path().join("absent.ndjson"));
        assert!(journal.read_all().unwrap().is_empty());
    }
}
