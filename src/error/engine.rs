/// Error engine - the terminal sink for every failure in the deployment core
///
/// The first classification of a code establishes its binding (category,
/// severity, strategy). Later occurrences only bump the count and are emitted
/// with the original binding, so a retry budget computed from the count is
/// stable no matter what later callers pass in. Nothing in here returns an
/// error to the classifier's caller.
use super::classification::{
    ErrorCategory, ErrorCode, ErrorContext, ErrorEvent, RecoveryStrategy, Severity,
};
use super::journal::ErrorJournal;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct Binding {
    category: ErrorCategory,
    severity: Severity,
    strategy: RecoveryStrategy,
    count: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

pub struct ErrorEngine {
    bindings: Mutex<HashMap<ErrorCode, Binding>>,
    journal: Option<ErrorJournal>,
}

impl ErrorEngine {
    /// In-memory engine without a journal
    pub fn new() -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
            journal: None,
        }
    }

    /// Engine that appends every event to an NDJSON journal
    pub fn with_journal(path: impl Into<PathBuf>) -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
            journal: Some(ErrorJournal::new(path)),
        }
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_ref().map(|j| j.path())
    }

    /// Classify one occurrence of `code`
    ///
    /// `severity` and `strategy` only take effect on the first occurrence;
    /// omitted values come from the code's default table.
    pub fn classify(
        &self,
        code: ErrorCode,
        context: &ErrorContext,
        severity: Option<Severity>,
        strategy: Option<RecoveryStrategy>,
    ) -> ErrorEvent {
        let now = Utc::now();

        let binding = {
            let mut bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
            let entry = bindings.entry(code.clone()).or_insert_with(|| {
                let (category, default_severity, default_strategy) = code.defaults();
                Binding {
                    category,
                    severity: severity.unwrap_or(default_severity),
                    strategy: strategy.unwrap_or(default_strategy),
                    count: 0,
                    first_seen: now,
                    last_seen: now,
                }
            });
            entry.count = entry.count.saturating_add(1);
            entry.last_seen = now;
            entry.clone()
        };

        let event = ErrorEvent {
            code,
            category: binding.category,
            severity: binding.severity,
            context: context.to_string(),
            recovery_strategy: binding.strategy,
            occurrence_count: binding.count,
            stack_id: context.stack_id.clone(),
            timestamp: now,
        };

        Self::log_event(&event);

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(&event) {
                tracing::warn!(
                    code = %event.code,
                    journal = %journal.path().display(),
                    error = %e,
                    "Failed to append error journal record"
                );
            }
        }

        event
    }

    /// Classify with the code's default binding
    pub fn record(&self, code: ErrorCode, context: &ErrorContext) -> ErrorEvent {
        self.classify(code, context, None, None)
    }

    fn log_event(event: &ErrorEvent) {
        let stack = event.stack_id.as_deref().unwrap_or("-");
        match event.severity {
            Severity::Info => tracing::info!(
                code = %event.code,
                category = %event.category,
                strategy = %event.recovery_strategy,
                occurrence = event.occurrence_count,
                stack_id = stack,
                context = %event.context,
                "{}", event.code.cause()
            ),
            Severity::Warning => tracing::warn!(
                code = %event.code,
                category = %event.category,
                strategy = %event.recovery_strategy,
                occurrence = event.occurrence_count,
                stack_id = stack,
                context = %event.context,
                "{}", event.code.cause()
            ),
            Severity::Error | Severity::Critical => tracing::error!(
                code = %event.code,
                category = %event.category,
                severity = %event.severity,
                strategy = %event.recovery_strategy,
                occurrence = event.occurrence_count,
                stack_id = stack,
                context = %event.context,
                "{}", event.code.cause()
            ),
        }
    }

    /// True only when the bound strategy is retry and the budget is not spent
    pub fn should_retry(&self, code: &ErrorCode, max_retries: u32) -> bool {
        let bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        match bindings.get(code) {
            Some(binding) => {
                binding.strategy == RecoveryStrategy::Retry && binding.count < max_retries as u64
            }
            None => false,
        }
    }

    pub fn occurrences(&self, code: &ErrorCode) -> u64 {
        let bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        bindings.get(code).map(|b| b.count).unwrap_or(0)
    }

    pub fn strategy_for(&self, code: &ErrorCode) -> Option<RecoveryStrategy> {
        let bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        bindings.get(code).map(|b| b.strategy)
    }

    /// Number of events classified under `category`
    pub fn count_by_category(&self, category: ErrorCategory) -> u64 {
        let bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        bindings
            .values()
            .filter(|b| b.category == category)
            .map(|b| b.count)
            .sum()
    }

    /// Explicitly re-bind the strategy of an already seen code
    ///
    /// Returns false when the code has never been classified.
    pub fn override_strategy(&self, code: &ErrorCode, strategy: RecoveryStrategy) -> bool {
        let mut bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        match bindings.get_mut(code) {
            Some(binding) => {
                if binding.strategy != strategy {
                    tracing::warn!(
                        code = %code,
                        from = %binding.strategy,
                        to = %strategy,
                        "Recovery strategy overridden"
                    );
                    binding.strategy = strategy;
                }
                true
            }
            None => false,
        }
    }

    /// Summary of everything classified so far
    pub fn report(&self) -> ErrorReport {
        let bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());

        let mut codes: Vec<CodeSummary> = bindings
            .iter()
            .map(|(code, b)| CodeSummary {
                code: code.clone(),
                category: b.category,
                severity: b.severity,
                strategy: b.strategy,
                occurrences: b.count,
                first_seen: b.first_seen,
                last_seen: b.last_seen,
            })
            .collect();
        codes.sort_by(|a, b| a.code.cmp(&b.code));

        let mut by_category = BTreeMap::new();
        for summary in &codes {
            *by_category.entry(summary.category.to_string()).or_insert(0) += summary.occurrences;
        }

        ErrorReport {
            generated_at: Utc::now(),
            total_events: codes.iter().map(|c| c.occurrences).sum(),
            by_category,
            codes,
        }
    }

    /// Persist the report as pretty JSON (called at process end)
    pub fn flush_report(&self, path: &Path) -> Result<ErrorReport> {
        let report = self.report();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create report directory")?;
            }
        }

        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write error report to {}", path.display()))?;

        Ok(report)
    }
}

impl Default for ErrorEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSummary {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub strategy: RecoveryStrategy,
    pub occurrences: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub generated_at: DateTime<Utc>,
    pub total_events: u64,
    pub by_category: BTreeMap<String, u64>,
    pub codes: Vec<CodeSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx() -> ErrorContext {
        ErrorContext::new("test_op").with_stack("ai-stack")
    }

    #[test]
    fn test_first_classification_binds_defaults() {
        let engine = ErrorEngine::new();
        let event = engine.record(ErrorCode::CapacityExhausted, &ctx());

        assert_eq!(event.occurrence_count, 1);
        assert_eq!(event.category, ErrorCategory::Capacity);
        assert_eq!(event.recovery_strategy, RecoveryStrategy::Fallback);
        assert_eq!(event.stack_id.as_deref(), Some("ai-stack"));
    }

    #[test]
    fn test_later_arguments_do_not_rebind() {
        let engine = ErrorEngine::new();
        engine.classify(
            ErrorCode::OperationTimeout,
            &ctx(),
            Some(Severity::Info),
            Some(RecoveryStrategy::Skip),
        );
        let second = engine.classify(
            ErrorCode::OperationTimeout,
            &ctx(),
            Some(Severity::Critical),
            Some(RecoveryStrategy::Abort),
        );

        assert_eq!(second.occurrence_count, 2);
        assert_eq!(second.severity, Severity::Info);
        assert_eq!(second.recovery_strategy, RecoveryStrategy::Skip);
    }

    #[test]
    fn test_should_retry_respects_strategy_and_budget() {
        let engine = ErrorEngine::new();
        assert!(!engine.should_retry(&ErrorCode::OperationTimeout, 3));

        engine.record(ErrorCode::OperationTimeout, &ctx());
        assert!(engine.should_retry(&ErrorCode::OperationTimeout, 3));
        engine.record(ErrorCode::OperationTimeout, &ctx());
        engine.record(ErrorCode::OperationTimeout, &ctx());
        assert!(!engine.should_retry(&ErrorCode::OperationTimeout, 3));

        engine.record(ErrorCode::CapacityExhausted, &ctx());
        assert!(!engine.should_retry(&ErrorCode::CapacityExhausted, 10));
    }

    #[test]
    fn test_override_strategy_escalates() {
        let engine = ErrorEngine::new();
        assert!(!engine.override_strategy(&ErrorCode::NetworkNotFound, RecoveryStrategy::Manual));

        engine.record(ErrorCode::NetworkNotFound, &ctx());
        assert!(engine.override_strategy(&ErrorCode::NetworkNotFound, RecoveryStrategy::Manual));

        let event = engine.record(ErrorCode::NetworkNotFound, &ctx());
        assert_eq!(event.recovery_strategy, RecoveryStrategy::Manual);
        assert_eq!(event.occurrence_count, 2);
    }

    #[test]
    fn test_journal_failure_does_not_propagate() {
        let temp = TempDir::new().unwrap();
        // A directory where the journal file should be makes every append fail
        let blocked = temp.path().join("journal");
        std::fs::create_dir_all(&blocked).unwrap();

        let engine = ErrorEngine::with_journal(&blocked);
        let event = engine.record(ErrorCode::DependencyNotReady, &ctx());
        assert_eq!(event.occurrence_count, 1);
        assert_eq!(engine.occurrences(&ErrorCode::DependencyNotReady), 1);
    }

    #[test]
    fn test_report_and_flush() {
        let temp = TempDir::new().unwrap();
        let engine = ErrorEngine::with_journal(temp.path().join("errors.ndjson"));

        engine.record(ErrorCode::CapacityExhausted, &ctx());
        engine.record(ErrorCode::CapacityExhausted, &ctx());
        engine.record(ErrorCode::InvalidCredentials, &ctx());

        let report = engine
            .flush_report(&temp.path().join("reports/errors.json"))
            .unwrap();
        assert_eq!(report.total_events, 3);
        assert_eq!(report.by_category.get("capacity"), Some(&2));
        assert_eq!(report.codes.len(), 2);
        assert!(temp.path().join("reports/errors.json").exists());

        let journal = ErrorJournal::new(temp.path().join("errors.ndjson"));
        assert_eq!(journal.read_all().unwrap().len(), 3);
    }

    #[test]
    fn test_concurrent_classification_counts_every_call() {
        let engine = std::sync::Arc::new(ErrorEngine::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = std::sync::Arc::clone(&engine);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        engine.record(ErrorCode::CapacityExhausted, &ctx());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(engine.occurrences(&ErrorCode::CapacityExhausted), 200);
    }
}
