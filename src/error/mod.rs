/// Error taxonomy and recovery engine
///
/// Every failure in the deployment core ends up here. The layers are:
///
/// ```text
/// ┌──────────────────────────────────────────┐
/// │   Provisioner / Registry / Validation /  │
/// │   Health Monitor (callers)               │
/// └────────────────┬─────────────────────────┘
///                  │ classify(code, context)
///                  ↓
/// ┌──────────────────────────────────────────┐
/// │   ErrorEngine                            │
/// │   - first-seen binding per code          │
/// │   - occurrence counts, should_retry      │
/// └──────┬─────────────────────┬─────────────┘
///        ↓                     ↓
/// ┌──────────────┐      ┌──────────────────┐
/// │ ErrorJournal │      │ ErrorReport      │
/// │ (NDJSON)     │      │ (flush at exit)  │
/// └──────────────┘      └──────────────────┘
/// ```
///
/// # Usage Example
///
/// ```rust,ignore
/// use gpu_stack_deploy::error::{ErrorCode, ErrorContext, ErrorEngine, RecoveryStrategy};
///
/// let engine = ErrorEngine::with_journal("/var/lib/stackctl/error-journal.ndjson");
/// let ctx = ErrorContext::for_candidate("ai-stack", "g4dn.xlarge", "us-east-1");
///
/// let event = engine.record(ErrorCode::CapacityExhausted, &ctx);
/// if event.recovery_strategy == RecoveryStrategy::Fallback {
///     // try the next candidate
/// }
/// ```

pub mod classification;
pub mod engine;
pub mod journal;
pub mod retry;

// Re-export main types for convenience
pub use classification::{
    ErrorCategory, ErrorCode, ErrorContext, ErrorEvent, RecoveryStrategy, Severity,
};
pub use engine::{CodeSummary, ErrorEngine, ErrorReport};
pub use journal::{append_record, read_records, ErrorJournal, JournalRecord};
pub use retry::{with_retry, RetryPolicy};
