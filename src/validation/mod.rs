/// Validation layer
///
/// Runs the named checks (dependencies, environment, modules, network) one
/// at a time or all together, with optional parallel fan-out, TTL caching and
/// exponential-backoff retry. A failed check is classified exactly once, no
/// matter how many attempts the retry policy made.
pub mod cache;
pub mod checks;
pub mod inputs;

pub use cache::{CacheKey, Clock, ManualClock, ResultCache, SystemClock};
pub use checks::{
    Check, CheckFailure, CheckOutcome, DependencyCheck, EnvironmentCheck, ModuleCheck,
    NetworkCheck,
};

use crate::error::{with_retry, ErrorCode, ErrorContext, ErrorEngine, RetryPolicy};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Unknown validation type: '{0}' (expected dependencies, environment, modules, network or all)")]
    UnknownType(String),

    #[error("Validation failed: {}", describe_failures(.failures))]
    Failed {
        failures: Vec<(ValidationType, String)>,
    },

    #[error(transparent)]
    Input(#[from] inputs::InputError),
}

fn describe_failures(failures: &[(ValidationType, String)]) -> String {
    failures
        .iter()
        .map(|(validation_type, output)| format!("{} ({})", validation_type, output))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ValidationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ValidationError::UnknownType(_) => ErrorCode::InvalidConfigurationValue,
            ValidationError::Failed { failures } => failures
                .first()
                .map(|(validation_type, _)| validation_type.failure_code())
                .unwrap_or(ErrorCode::MissingRequiredParameter),
            ValidationError::Input(_) => ErrorCode::InvalidConfigurationValue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationType {
    Dependencies,
    Environment,
    Modules,
    Network,
}

impl ValidationType {
    pub const ALL: [ValidationType; 4] = [
        ValidationType::Dependencies,
        ValidationType::Environment,
        ValidationType::Modules,
        ValidationType::Network,
    ];

    /// Network results are time-sensitive and never cached
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, ValidationType::Network)
    }

    /// Code used when a check fails without naming one
    pub fn failure_code(&self) -> ErrorCode {
        match self {
            ValidationType::Dependencies => ErrorCode::DependencyNotReady,
            ValidationType::Environment => ErrorCode::InvalidConfigurationValue,
            ValidationType::Modules => ErrorCode::ModuleMissing,
            ValidationType::Network => ErrorCode::EndpointUnreachable,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationType::Dependencies => "dependencies",
            ValidationType::Environment => "environment",
            ValidationType::Modules => "modules",
            ValidationType::Network => "network",
        }
    }
}

impl fmt::Display for ValidationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One check or all of them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationTarget {
    One(ValidationType),
    All,
}

impl FromStr for ValidationTarget {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            return Ok(ValidationTarget::All);
        }
        ValidationType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .map(ValidationTarget::One)
            .ok_or_else(|| ValidationError::UnknownType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub validation_type: ValidationType,
    pub status: CheckStatus,
    pub output: String,
    pub timestamp: DateTime<Utc>,
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Passed
    }
}

/// Results of every check; fails if any check failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub passed: bool,
    pub results: Vec<CheckResult>,
}

impl AggregateResult {
    pub fn failed_types(&self) -> Vec<ValidationType> {
        self.results
            .iter()
            .filter(|r| !r.passed())
            .map(|r| r.validation_type)
            .collect()
    }

    pub fn result(&self, validation_type: ValidationType) -> Option<&CheckResult> {
        self.results
            .iter()
            .find(|r| r.validation_type == validation_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunOutcome {
    Single(CheckResult),
    Aggregate(AggregateResult),
}

impl RunOutcome {
    pub fn passed(&self) -> bool {
        match self {
            RunOutcome::Single(result) => result.passed(),
            RunOutcome::Aggregate(aggregate) => aggregate.passed,
        }
    }

    pub fn results(&self) -> Vec<&CheckResult> {
        match self {
            RunOutcome::Single(result) => vec![result],
            RunOutcome::Aggregate(aggregate) => aggregate.results.iter().collect(),
        }
    }

    /// Error form for callers that gate on validation
    pub fn into_result(self) -> Result<RunOutcome, ValidationError> {
        if self.passed() {
            return Ok(self);
        }
        let failures = self
            .results()
            .into_iter()
            .filter(|r| !r.passed())
            .map(|r| (r.validation_type, r.output.clone()))
            .collect();
        Err(ValidationError::Failed { failures })
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Run `all` concurrently
    pub parallel: bool,

    /// Serve cacheable checks from the TTL cache
    pub cache: bool,

    /// Wrap each check in exponential-backoff retry
    pub retry: bool,

    pub ttl: Duration,

    /// Cache discriminator (e.g. the stack id)
    pub context: Option<String>,

    pub retry_policy: RetryPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            cache: true,
            retry: false,
            ttl: Duration::from_secs(3600),
            context: None,
            retry_policy: RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(30)),
        }
    }
}

pub struct Validator {
    checks: HashMap<ValidationType, Arc<dyn Check>>,
    cache: ResultCache,
    engine: Arc<ErrorEngine>,
    clock: Arc<dyn Clock>,
}

impl Validator {
    pub fn new(engine: Arc<ErrorEngine>) -> Self {
        Self {
            checks: HashMap::new(),
            cache: ResultCache::new(),
            engine,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Install a check, replacing any check of the same type
    pub fn with_check(mut self, check: Arc<dyn Check>) -> Self {
        self.checks.insert(check.validation_type(), check);
        self
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub async fn run(&self, target: ValidationTarget, options: &RunOptions) -> RunOutcome {
        match target {
            ValidationTarget::One(validation_type) => {
                RunOutcome::Single(self.run_one(validation_type, options).await)
            }
            ValidationTarget::All => RunOutcome::Aggregate(self.run_all(options).await),
        }
    }

    /// Every check; a failing sibling never drops a passed result
    pub async fn run_all(&self, options: &RunOptions) -> AggregateResult {
        let results = if options.parallel {
            join_all(
                ValidationType::ALL
                    .iter()
                    .map(|validation_type| self.run_one(*validation_type, options)),
            )
            .await
        } else {
            let mut results = Vec::with_capacity(ValidationType::ALL.len());
            for validation_type in ValidationType::ALL {
                results.push(self.run_one(validation_type, options).await);
            }
            results
        };

        let passed = results.iter().all(CheckResult::passed);
        if !passed {
            tracing::warn!(
                failed = results.iter().filter(|r| !r.passed()).count(),
                total = results.len(),
                "Validation failed"
            );
        }

        AggregateResult { passed, results }
    }

    pub async fn run_one(&self, validation_type: ValidationType, options: &RunOptions) -> CheckResult {
        let cacheable = options.cache && validation_type.is_cacheable();
        let key = CacheKey::new(validation_type, options.context.as_deref(), self.clock.now());

        if cacheable {
            if let Some(hit) = self.cache.get(&key, self.clock.now(), options.ttl) {
                tracing::debug!(validation = %validation_type, "Validation served from cache");
                return hit;
            }
        }

        let outcome = match self.checks.get(&validation_type) {
            Some(check) => self.execute(check.as_ref(), options).await,
            None => Err(CheckFailure::new(
                validation_type.failure_code(),
                "no check configured",
            )),
        };

        let result = match outcome {
            Ok(output) => CheckResult {
                validation_type,
                status: CheckStatus::Passed,
                output,
                timestamp: self.clock.now(),
            },
            Err(failure) => {
                let mut ctx = ErrorContext::new("validation")
                    .with_metadata("validation_type", validation_type.as_str());
                if let Some(context) = &options.context {
                    ctx = ctx.with_stack(context.as_str());
                }
                self.engine.record(failure.code, &ctx);

                CheckResult {
                    validation_type,
                    status: CheckStatus::Failed,
                    output: failure.output,
                    timestamp: self.clock.now(),
                }
            }
        };

        // Only passing results are cached; a fix must show up on the next run
        if cacheable && result.passed() {
            self.cache.put(key, result.clone());
        }

        result
    }

    async fn execute(&self, check: &dyn Check, options: &RunOptions) -> CheckOutcome {
        if !options.retry {
            return check.execute().await;
        }

        with_retry(
            &options.retry_policy,
            |attempt| async move {
                let outcome = check.execute().await;
                if let Err(failure) = &outcome {
                    tracing::debug!(
                        validation = %check.validation_type(),
                        attempt = attempt + 1,
                        output = %failure.output,
                        "Check attempt failed"
                    );
                }
                outcome
            },
            |_| true,
        )
        .await
    }
}
