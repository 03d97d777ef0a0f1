/// Cloud capability interface
///
/// The deployment core never talks to a vendor SDK directly. Everything it
/// needs from a provider goes through `CloudCapability`, which is injected
/// into the provisioner, registry teardown and health probes at construction.
use crate::error::ErrorCode;
use crate::ResourceType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod simulated;

pub use simulated::SimulatedCloud;

/// One compute allocation attempt against a single candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub stack_id: String,
    pub instance_class: String,
    pub region: String,

    /// Interruptible (spot) capacity rather than guaranteed
    pub interruptible: bool,

    /// Bid ceiling for interruptible capacity (USD/hour)
    pub max_spot_price: Option<f64>,
}

/// Provider-side lifecycle state of a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum ResourceState {
    Pending,
    Running,
    Available,
    Attached,
    Updating,
    Complete,
    Failed(String),
    Stopped,
    Terminated,
    NotFound,
}

impl ResourceState {
    /// Terminal state that still counts as existing and usable
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ResourceState::Running
                | ResourceState::Available
                | ResourceState::Attached
                | ResourceState::Complete
        )
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, ResourceState::Terminated | ResourceState::NotFound)
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceState::Pending => f.write_str("pending"),
            ResourceState::Running => f.write_str("running"),
            ResourceState::Available => f.write_str("available"),
            ResourceState::Attached => f.write_str("attached"),
            ResourceState::Updating => f.write_str("updating"),
            ResourceState::Complete => f.write_str("complete"),
            ResourceState::Failed(reason) => write!(f, "failed ({})", reason),
            ResourceState::Stopped => f.write_str("stopped"),
            ResourceState::Terminated => f.write_str("terminated"),
            ResourceState::NotFound => f.write_str("not_found"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescription {
    pub resource_id: String,
    pub state: ResourceState,

    /// Number of attachments (volumes: instances mounting it)
    pub attachments: u32,
}

impl ResourceDescription {
    pub fn not_found(resource_id: &str) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            state: ResourceState::NotFound,
            attachments: 0,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CloudError {
    /// The provider refused the request with a classified code
    #[error("Request rejected ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("Request timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    #[error("Transport failure: {0}")]
    Transport(String),
}

impl CloudError {
    pub fn rejected(code: ErrorCode, message: impl Into<String>) -> Self {
        CloudError::Rejected {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            CloudError::Rejected { code, .. } => code.clone(),
            CloudError::Timeout(_) => ErrorCode::OperationTimeout,
            CloudError::Transport(_) => ErrorCode::EndpointUnreachable,
        }
    }
}

/// Narrow provider interface consumed by the core
#[async_trait]
pub trait CloudCapability: Send + Sync {
    /// Allocate compute for one candidate, returning the provider resource id
    async fn allocate_compute(&self, request: &AllocationRequest) -> Result<String, CloudError>;

    /// Release a resource. Releasing something already gone succeeds.
    async fn release_resource(
        &self,
        resource_id: &str,
        resource_type: ResourceType,
    ) -> Result<(), CloudError>;

    /// Current state; unknown ids describe as `ResourceState::NotFound`
    async fn describe_resource(&self, resource_id: &str) -> Result<ResourceDescription, CloudError>;

    /// Hit a service health path, returning the observed latency
    async fn probe_service_endpoint(&self, url: &str, timeout: Duration)
        -> Result<Duration, CloudError>;
}
