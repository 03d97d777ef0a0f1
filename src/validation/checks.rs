/// Built-in validation checks
use super::inputs;
use super::ValidationType;
use crate::cloud::CloudCapability;
use crate::error::ErrorCode;
use async_trait::async_trait;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Why a check failed
#[derive(Debug, Clone, PartialEq)]
pub struct CheckFailure {
    pub code: ErrorCode,
    pub output: String,
}

impl CheckFailure {
    pub fn new(code: ErrorCode, output: impl Into<String>) -> Self {
        Self {
            code,
            output: output.into(),
        }
    }
}

/// Output on success, classified failure otherwise
pub type CheckOutcome = Result<String, CheckFailure>;

#[async_trait]
pub trait Check: Send + Sync {
    fn validation_type(&self) -> ValidationType;

    async fn execute(&self) -> CheckOutcome;
}

/// Required binaries are on PATH
pub struct DependencyCheck {
    binaries: Vec<String>,
    search_path: Option<std::ffi::OsString>,
}

impl DependencyCheck {
    pub fn new(binaries: Vec<String>) -> Self {
        Self {
            binaries,
            search_path: None,
        }
    }

    /// Search this PATH-style list instead of the process PATH
    pub fn with_search_path(mut self, path: impl Into<std::ffi::OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    fn locate(&self, binary: &str) -> Option<PathBuf> {
        let path = self
            .search_path
            .clone()
            .or_else(|| std::env::var_os("PATH"))?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(binary))
            .find(|candidate| candidate.is_file())
    }
}

#[async_trait]
impl Check for DependencyCheck {
    fn validation_type(&self) -> ValidationType {
        ValidationType::Dependencies
    }

    async fn execute(&self) -> CheckOutcome {
        let mut found = Vec::new();
        let mut missing = Vec::new();

        for binary in &self.binaries {
            match self.locate(binary) {
                Some(path) => found.push(format!("{} ({})", binary, path.display())),
                None => missing.push(binary.as_str()),
            }
        }

        if missing.is_empty() {
            Ok(format!("found: {}", found.join(", ")))
        } else {
            Err(CheckFailure::new(
                ErrorCode::DependencyNotReady,
                format!("missing binaries: {}", missing.join(", ")),
            ))
        }
    }
}

/// Required environment variables are set and well-known deployment
/// inputs follow their rules
pub struct EnvironmentCheck {
    required: Vec<String>,
}

impl EnvironmentCheck {
    pub fn new(required: Vec<String>) -> Self {
        Self { required }
    }

    fn rule_violations() -> Vec<String> {
        let mut violations = Vec::new();

        let mut check = |var: &str, rule: fn(&str) -> Result<(), inputs::InputError>| {
            if let Ok(value) = std::env::var(var) {
                if let Err(e) = rule(&value) {
                    violations.push(format!("{}: {}", var, e));
                }
            }
        };

        check("AWS_REGION", inputs::validate_region);
        check("INSTANCE_TYPE", inputs::validate_instance_type);
        check("STACK_NAME", inputs::validate_stack_name);
        check("SPOT_PRICE", |v| inputs::validate_spot_price(v).map(|_| ()));

        violations
    }
}

#[async_trait]
impl Check for EnvironmentCheck {
    fn validation_type(&self) -> ValidationType {
        ValidationType::Environment
    }

    async fn execute(&self) -> CheckOutcome {
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|var| std::env::var(var.as_str()).map(|v| v.trim().is_empty()).unwrap_or(true))
            .map(String::as_str)
            .collect();

        if !missing.is_empty() {
            return Err(CheckFailure::new(
                ErrorCode::MissingRequiredParameter,
                format!("missing environment variables: {}", missing.join(", ")),
            ));
        }

        let violations = Self::rule_violations();
        if !violations.is_empty() {
            return Err(CheckFailure::new(
                ErrorCode::InvalidConfigurationValue,
                violations.join("; "),
            ));
        }

        Ok(format!("{} required variables set", self.required.len()))
    }
}

/// Required files of the deployment bundle exist
pub struct ModuleCheck {
    root: PathBuf,
    files: Vec<PathBuf>,
}

impl ModuleCheck {
    pub fn new(root: impl Into<PathBuf>, files: Vec<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files,
        }
    }

    fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.root.join(file)
        }
    }
}

#[async_trait]
impl Check for ModuleCheck {
    fn validation_type(&self) -> ValidationType {
        ValidationType::Modules
    }

    async fn execute(&self) -> CheckOutcome {
        let missing: Vec<String> = self
            .files
            .iter()
            .filter(|file| !self.resolve(file).exists())
            .map(|file| file.display().to_string())
            .collect();

        if missing.is_empty() {
            Ok(format!("{} modules present", self.files.len()))
        } else {
            Err(CheckFailure::new(
                ErrorCode::ModuleMissing,
                format!("missing modules: {}", missing.join(", ")),
            ))
        }
    }
}

/// Service endpoints answer their health path. Never cached.
pub struct NetworkCheck {
    cloud: Arc<dyn CloudCapability>,
    endpoints: Vec<String>,
    timeout: Duration,
}

impl NetworkCheck {
    pub fn new(cloud: Arc<dyn CloudCapability>, endpoints: Vec<String>, timeout: Duration) -> Self {
        Self {
            cloud,
            endpoints,
            timeout,
        }
    }
}

#[async_trait]
impl Check for NetworkCheck {
    fn validation_type(&self) -> ValidationType {
        ValidationType::Network
    }

    async fn execute(&self) -> CheckOutcome {
        let probes = self.endpoints.iter().map(|url| async move {
            let probe = self.cloud.probe_service_endpoint(url, self.timeout);
            let outcome = match tokio::time::timeout(self.timeout, probe).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!(
                    "no answer within {}",
                    humantime::format_duration(self.timeout)
                )),
            };
            (url, outcome)
        });

        let mut reachable = Vec::new();
        let mut unreachable = Vec::new();
        for (url, outcome) in join_all(probes).await {
            match outcome {
                Ok(latency) => reachable.push(format!("{} ({}ms)", url, latency.as_millis())),
                Err(reason) => unreachable.push(format!("{} ({})", url, reason)),
            }
        }

        if unreachable.is_empty() {
            Ok(format!("reachable: {}", reachable.join(", ")))
        } else {
            Err(CheckFailure::new(
                ErrorCode::EndpointUnreachable,
                format!("unreachable: {}", unreachable.join(", ")),
            ))
        }
    }
}
