pub mod cloud;
pub mod config;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod provisioner;
pub mod registry;
pub mod validation;

// Re-export the deployment facade for convenience
pub use config::DeployConfig;
pub use orchestrator::Deployment;

use error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Top-level error surfaced to the CLI and other callers of the facade
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Resource registry error: {0}")]
    Registry(#[from] registry::RegistryError),

    #[error("Provisioning failed: {0}")]
    Provision(#[from] provisioner::ProvisionError),

    #[error("Validation error: {0}")]
    Validation(#[from] validation::ValidationError),

    #[error("Cloud provider error: {0}")]
    Cloud(#[from] cloud::CloudError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Error code behind this failure, when one was classified
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            DeployError::Registry(e) => Some(e.code()),
            DeployError::Provision(e) => Some(e.code()),
            DeployError::Validation(e) => Some(e.code()),
            DeployError::Cloud(e) => Some(e.code()),
            DeployError::Config(_) => Some(ErrorCode::InvalidConfigurationValue),
            DeployError::Io(_) => None,
        }
    }

    /// Concrete remediation steps for the operator
    pub fn remediation(&self) -> Vec<&'static str> {
        match self.code() {
            Some(code) => code.remediation().to_vec(),
            None => vec!["Check file permissions and free space in the state directory"],
        }
    }
}

pub type DeployResult<T> = Result<T, DeployError>;

/// Kind of cloud resource tracked by the registry
///
/// The teardown rank encodes the reverse-dependency partial order: resources
/// with a lower rank are released first. Compute goes before the storage it
/// mounts and the network it lives in; identity policies go before the
/// identities they reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
    LoadBalancer,
    Compute,
    Storage,
    SecurityRule,
    Route,
    Secret,
    IdentityPolicy,
    Identity,
    Network,
    Stack,
}

impl ResourceType {
    pub const ALL: [ResourceType; 10] = [
        ResourceType::LoadBalancer,
        ResourceType::Compute,
        ResourceType::Storage,
        ResourceType::SecurityRule,
        ResourceType::Route,
        ResourceType::Secret,
        ResourceType::IdentityPolicy,
        ResourceType::Identity,
        ResourceType::Network,
        ResourceType::Stack,
    ];

    /// Position in teardown order (lower is released earlier)
    pub fn teardown_rank(&self) -> u8 {
        match self {
            ResourceType::LoadBalancer => 0,
            ResourceType::Compute => 1,
            ResourceType::Storage => 2,
            ResourceType::SecurityRule | ResourceType::Route | ResourceType::Secret => 3,
            ResourceType::IdentityPolicy => 4,
            ResourceType::Identity => 5,
            ResourceType::Network => 6,
            ResourceType::Stack => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::LoadBalancer => "load-balancer",
            ResourceType::Compute => "compute",
            ResourceType::Storage => "storage",
            ResourceType::SecurityRule => "security-rule",
            ResourceType::Route => "route",
            ResourceType::Secret => "secret",
            ResourceType::IdentityPolicy => "identity-policy",
            ResourceType::Identity => "identity",
            ResourceType::Network => "network",
            ResourceType::Stack => "stack",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown resource type: {}", s))
    }
}

#[cfg(test)]
mod lib_tests;
