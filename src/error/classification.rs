/// Error taxonomy for recovery strategy selection
///
/// Every failure observed by the deployment core is reduced to an `ErrorCode`.
/// Each code carries a fixed default binding of category, severity and
/// recovery strategy which the `ErrorEngine` applies when a caller does not
/// supply its own.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Classification bucket. Every event maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Validation,
    Infrastructure,
    Network,
    Authentication,
    Authorization,
    Capacity,
    Timeout,
    Dependency,
    Configuration,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 9] = [
        ErrorCategory::Validation,
        ErrorCategory::Infrastructure,
        ErrorCategory::Network,
        ErrorCategory::Authentication,
        ErrorCategory::Authorization,
        ErrorCategory::Capacity,
        ErrorCategory::Timeout,
        ErrorCategory::Dependency,
        ErrorCategory::Configuration,
    ];

    /// Errors in these categories are never retried and always reach the caller
    pub fn always_propagates(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Authentication
                | ErrorCategory::Authorization
                | ErrorCategory::Configuration
        )
    }

    /// Categories that fall back by default but escalate to manual once
    /// every fallback candidate is spent
    pub fn escalates_after_fallback(&self) -> bool {
        matches!(self, ErrorCategory::Infrastructure | ErrorCategory::Network)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Infrastructure => "infrastructure",
            ErrorCategory::Network => "network",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::Capacity => "capacity",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Dependency => "dependency",
            ErrorCategory::Configuration => "configuration",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Policy bound to an error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    /// Repeat the same operation after a backoff delay
    Retry,

    /// Move on to the next candidate
    Fallback,

    /// Record and continue with the next unit of work
    Skip,

    /// Stop the current operation
    Abort,

    /// Stop and hand over to an operator
    Manual,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::Skip => "skip",
            RecoveryStrategy::Abort => "abort",
            RecoveryStrategy::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Stable symbolic identifier for a failure family
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    CapacityExhausted,
    InstanceLimitExceeded,
    SpotBidTooLow,
    NetworkNotFound,
    SecurityRuleInvalid,
    InvalidCredentials,
    InsufficientPermissions,
    InvalidConfigurationValue,
    MissingRequiredParameter,
    OperationTimeout,
    DependencyNotReady,
    EndpointUnreachable,
    ModuleMissing,
    TeardownFailed,
    ResourceConflict,
    /// Code not in the predefined table; defaults to infrastructure/error/manual
    Other(String),
}

impl ErrorCode {
    pub const PREDEFINED: [ErrorCode; 15] = [
        ErrorCode::CapacityExhausted,
        ErrorCode::InstanceLimitExceeded,
        ErrorCode::SpotBidTooLow,
        ErrorCode::NetworkNotFound,
        ErrorCode::SecurityRuleInvalid,
        ErrorCode::InvalidCredentials,
        ErrorCode::InsufficientPermissions,
        ErrorCode::InvalidConfigurationValue,
        ErrorCode::MissingRequiredParameter,
        ErrorCode::OperationTimeout,
        ErrorCode::DependencyNotReady,
        ErrorCode::EndpointUnreachable,
        ErrorCode::ModuleMissing,
        ErrorCode::TeardownFailed,
        ErrorCode::ResourceConflict,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::CapacityExhausted => "capacity-exhausted",
            ErrorCode::InstanceLimitExceeded => "instance-limit-exceeded",
            ErrorCode::SpotBidTooLow => "spot-bid-too-low",
            ErrorCode::NetworkNotFound => "network-not-found",
            ErrorCode::SecurityRuleInvalid => "security-rule-invalid",
            ErrorCode::InvalidCredentials => "invalid-credentials",
            ErrorCode::InsufficientPermissions => "insufficient-permissions",
            ErrorCode::InvalidConfigurationValue => "invalid-configuration-value",
            ErrorCode::MissingRequiredParameter => "missing-required-parameter",
            ErrorCode::OperationTimeout => "operation-timeout",
            ErrorCode::DependencyNotReady => "dependency-not-ready",
            ErrorCode::EndpointUnreachable => "endpoint-unreachable",
            ErrorCode::ModuleMissing => "module-missing",
            ErrorCode::TeardownFailed => "teardown-failed",
            ErrorCode::ResourceConflict => "resource-conflict",
            ErrorCode::Other(code) => code,
        }
    }

    /// Default (category, severity, strategy) triple for this code
    pub fn defaults(&self) -> (ErrorCategory, Severity, RecoveryStrategy) {
        use ErrorCategory as C;
        use RecoveryStrategy as R;
        use Severity as S;

        match self {
            ErrorCode::CapacityExhausted => (C::Capacity, S::Warning, R::Fallback),
            ErrorCode::InstanceLimitExceeded => (C::Capacity, S::Error, R::Fallback),
            ErrorCode::SpotBidTooLow => (C::Capacity, S::Warning, R::Fallback),
            ErrorCode::NetworkNotFound => (C::Network, S::Error, R::Fallback),
            ErrorCode::SecurityRuleInvalid => (C::Infrastructure, S::Error, R::Fallback),
            ErrorCode::InvalidCredentials => (C::Authentication, S::Critical, R::Manual),
            ErrorCode::InsufficientPermissions => (C::Authorization, S::Critical, R::Manual),
            ErrorCode::InvalidConfigurationValue => (C::Configuration, S::Error, R::Manual),
            ErrorCode::MissingRequiredParameter => (C::Configuration, S::Error, R::Manual),
            ErrorCode::OperationTimeout => (C::Timeout, S::Warning, R::Retry),
            ErrorCode::DependencyNotReady => (C::Dependency, S::Warning, R::Retry),
            ErrorCode::EndpointUnreachable => (C::Network, S::Warning, R::Retry),
            ErrorCode::ModuleMissing => (C::Validation, S::Error, R::Abort),
            ErrorCode::TeardownFailed => (C::Infrastructure, S::Error, R::Skip),
            ErrorCode::ResourceConflict => (C::Infrastructure, S::Error, R::Abort),
            ErrorCode::Other(_) => (C::Infrastructure, S::Error, R::Manual),
        }
    }

    /// Human-readable cause
    pub fn cause(&self) -> &'static str {
        match self {
            ErrorCode::CapacityExhausted => "The provider has no capacity for this instance class in this region",
            ErrorCode::InstanceLimitExceeded => "The account instance quota for this class is exhausted",
            ErrorCode::SpotBidTooLow => "The maximum spot price is below the current market price",
            ErrorCode::NetworkNotFound => "The target network (VPC/subnet) does not exist",
            ErrorCode::SecurityRuleInvalid => "A security group rule was rejected by the provider",
            ErrorCode::InvalidCredentials => "The provider rejected the supplied credentials",
            ErrorCode::InsufficientPermissions => "The credentials lack a permission the operation needs",
            ErrorCode::InvalidConfigurationValue => "A configuration value is outside its allowed range",
            ErrorCode::MissingRequiredParameter => "A required parameter or environment variable is missing",
            ErrorCode::OperationTimeout => "The operation did not finish within its timeout",
            ErrorCode::DependencyNotReady => "A dependency is not ready yet",
            ErrorCode::EndpointUnreachable => "A service endpoint did not answer its health path",
            ErrorCode::ModuleMissing => "A required module or file is missing from the deployment bundle",
            ErrorCode::TeardownFailed => "A resource could not be released during teardown",
            ErrorCode::ResourceConflict => "The resource is already registered to another stack",
            ErrorCode::Other(_) => "Unclassified provider failure",
        }
    }

    /// Concrete remediation actions (never empty)
    pub fn remediation(&self) -> &'static [&'static str] {
        match self {
            ErrorCode::CapacityExhausted => &[
                "Add more instance classes or regions to the fallback matrix",
                "Retry later or switch to guaranteed (on-demand) capacity",
            ],
            ErrorCode::InstanceLimitExceeded => &[
                "Request a service quota increase for the instance family",
                "Release unused instances in the account",
            ],
            ErrorCode::SpotBidTooLow => &[
                "Raise provisioning.max_spot_price",
                "Allow guaranteed capacity for this shape",
            ],
            ErrorCode::NetworkNotFound => &[
                "Verify the network identifiers in the configuration",
                "Re-create the network layer for the stack",
            ],
            ErrorCode::SecurityRuleInvalid => &[
                "Check port ranges and CIDR blocks in the security rules",
            ],
            ErrorCode::InvalidCredentials => &[
                "Refresh or re-export the provider credentials",
                "Check the configured profile and region",
            ],
            ErrorCode::InsufficientPermissions => &[
                "Attach the missing permission to the deploying identity",
            ],
            ErrorCode::InvalidConfigurationValue => &[
                "Correct the value reported in the error context",
            ],
            ErrorCode::MissingRequiredParameter => &[
                "Set the missing parameter in the config file or environment",
            ],
            ErrorCode::OperationTimeout => &[
                "Retry the operation",
                "Increase the configured timeout",
            ],
            ErrorCode::DependencyNotReady => &[
                "Wait for the dependency to become ready and retry",
            ],
            ErrorCode::EndpointUnreachable => &[
                "Check the service container logs",
                "Verify security rules allow the health port",
            ],
            ErrorCode::ModuleMissing => &[
                "Restore the missing file from the deployment bundle",
            ],
            ErrorCode::TeardownFailed => &[
                "Release the resource manually in the provider console",
                "Re-run teardown for the stack",
            ],
            ErrorCode::ResourceConflict => &[
                "Tear down the owning stack before reusing the resource",
            ],
            ErrorCode::Other(_) => &["Inspect the error journal for the full provider message"],
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ErrorCode {
    fn from(s: String) -> Self {
        ErrorCode::PREDEFINED
            .iter()
            .find(|code| code.as_str() == s)
            .cloned()
            .unwrap_or(ErrorCode::Other(s))
    }
}

impl From<&str> for ErrorCode {
    fn from(s: &str) -> Self {
        ErrorCode::from(s.to_string())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

/// Where an error happened
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Operation name (e.g. "allocate_compute", "teardown", "health_probe")
    pub operation: String,

    /// Owning stack, when known
    pub stack_id: Option<String>,

    /// Additional metadata (candidate, region, domain...)
    pub metadata: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            stack_id: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Context for an allocation attempt against one candidate
    pub fn for_candidate(stack_id: &str, instance_class: &str, region: &str) -> Self {
        Self::new("allocate_compute")
            .with_stack(stack_id)
            .with_metadata("instance_class", instance_class)
            .with_metadata("region", region)
    }

    pub fn with_stack(mut self, stack_id: impl Into<String>) -> Self {
        self.stack_id = Some(stack_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.operation)?;
        if !self.metadata.is_empty() {
            let pairs: Vec<String> = self
                .metadata
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, " [{}]", pairs.join(", "))?;
        }
        Ok(())
    }
}

/// One classified occurrence of an error code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub context: String,
    pub recovery_strategy: RecoveryStrategy,
    pub occurrence_count: u64,
    pub stack_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorEvent {
    pub fn cause(&self) -> &'static str {
        self.code.cause()
    }

    pub fn remediation(&self) -> &'static [&'static str] {
        self.code.remediation()
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}/{}) in {}: {} [strategy: {}, occurrence {}]",
            self.code,
            self.category,
            self.severity,
            self.context,
            self.code.cause(),
            self.recovery_strategy,
            self.occurrence_count
        )
    }
}
