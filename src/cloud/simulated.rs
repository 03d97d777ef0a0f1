/// In-process cloud provider
///
/// Behaviour is scripted up front: which candidates reject and with what
/// code, which resources exist in which state, how service endpoints answer
/// and which releases fail. Every call is recorded so callers can assert on
/// what the core actually asked for.
use super::{AllocationRequest, CloudCapability, CloudError, ResourceDescription, ResourceState};
use crate::error::ErrorCode;
use crate::ResourceType;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
enum Rejection {
    Always(ErrorCode),
    Times(ErrorCode, u32),
}

#[derive(Debug, Clone)]
struct EndpointBehavior {
    healthy: bool,
    latency: Duration,
}

#[derive(Default)]
struct SimState {
    rejections: HashMap<(String, String), VecDeque<Rejection>>,
    resources: HashMap<String, ResourceDescription>,
    endpoints: HashMap<String, EndpointBehavior>,
    failing_releases: HashSet<String>,
    allocations: Vec<AllocationRequest>,
    releases: Vec<(String, ResourceType)>,
    allocation_latency: Duration,
    region_latency: HashMap<String, Duration>,
    describe_latency: HashMap<String, Duration>,
    market_price: Option<f64>,
}

#[derive(Default)]
pub struct SimulatedCloud {
    state: Mutex<SimState>,
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every allocation for this candidate fails with `code`
    pub fn reject(&self, instance_class: &str, region: &str, code: ErrorCode) -> &Self {
        self.lock()
            .rejections
            .entry((instance_class.to_string(), region.to_string()))
            .or_default()
            .push_back(Rejection::Always(code));
        self
    }

    /// The next `times` allocations for this candidate fail with `code`
    pub fn reject_times(
        &self,
        instance_class: &str,
        region: &str,
        code: ErrorCode,
        times: u32,
    ) -> &Self {
        self.lock()
            .rejections
            .entry((instance_class.to_string(), region.to_string()))
            .or_default()
            .push_back(Rejection::Times(code, times));
        self
    }

    /// Spot market price; interruptible bids below it are rejected
    pub fn set_market_price(&self, price: f64) -> &Self {
        self.lock().market_price = Some(price);
        self
    }

    pub fn set_allocation_latency(&self, latency: Duration) -> &Self {
        self.lock().allocation_latency = latency;
        self
    }

    /// Allocation latency for one region, overriding the global one
    pub fn set_region_latency(&self, region: &str, latency: Duration) -> &Self {
        self.lock().region_latency.insert(region.to_string(), latency);
        self
    }

    /// Seed or replace a resource
    pub fn put_resource(&self, resource_id: &str, state: ResourceState, attachments: u32) -> &Self {
        self.lock().resources.insert(
            resource_id.to_string(),
            ResourceDescription {
                resource_id: resource_id.to_string(),
                state,
                attachments,
            },
        );
        self
    }

    pub fn set_state(&self, resource_id: &str, state: ResourceState) -> &Self {
        let mut sim = self.lock();
        if let Some(desc) = sim.resources.get_mut(resource_id) {
            desc.state = state;
        }
        drop(sim);
        self
    }

    /// Slow down `describe_resource` for one id
    pub fn set_describe_latency(&self, resource_id: &str, latency: Duration) -> &Self {
        self.lock()
            .describe_latency
            .insert(resource_id.to_string(), latency);
        self
    }

    pub fn set_endpoint(&self, url: &str, healthy: bool, latency: Duration) -> &Self {
        self.lock()
            .endpoints
            .insert(url.to_string(), EndpointBehavior { healthy, latency });
        self
    }

    pub fn fail_release(&self, resource_id: &str) -> &Self {
        self.lock().failing_releases.insert(resource_id.to_string());
        self
    }

    /// Every allocation request received, in order
    pub fn allocation_requests(&self) -> Vec<AllocationRequest> {
        self.lock().allocations.clone()
    }

    pub fn allocation_count(&self) -> usize {
        self.lock().allocations.len()
    }

    /// Every successful release, in order
    pub fn released(&self) -> Vec<(String, ResourceType)> {
        self.lock().releases.clone()
    }

    fn next_rejection(sim: &mut SimState, request: &AllocationRequest) -> Option<ErrorCode> {
        let key = (request.instance_class.clone(), request.region.clone());
        let queue = sim.rejections.get_mut(&key)?;

        let (code, exhausted) = match queue.front_mut()? {
            Rejection::Always(code) => (code.clone(), false),
            Rejection::Times(code, remaining) => {
                *remaining -= 1;
                (code.clone(), *remaining == 0)
            }
        };
        if exhausted {
            queue.pop_front();
        }
        Some(code)
    }
}

#[async_trait]
impl CloudCapability for SimulatedCloud {
    async fn allocate_compute(&self, request: &AllocationRequest) -> Result<String, CloudError> {
        let latency = {
            let mut sim = self.lock();
            sim.allocations.push(request.clone());
            sim.region_latency
                .get(&request.region)
                .copied()
                .unwrap_or(sim.allocation_latency)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut sim = self.lock();

        if let Some(code) = Self::next_rejection(&mut sim, request) {
            return Err(CloudError::rejected(
                code,
                format!(
                    "{} unavailable in {}",
                    request.instance_class, request.region
                ),
            ));
        }

        if request.interruptible {
            if let (Some(bid), Some(market)) = (request.max_spot_price, sim.market_price) {
                if bid < market {
                    return Err(CloudError::rejected(
                        ErrorCode::SpotBidTooLow,
                        format!("bid {:.2} below market {:.2}", bid, market),
                    ));
                }
            }
        }

        let id = format!("i-{}", &Uuid::new_v4().simple().to_string()[..17]);
        sim.resources.insert(
            id.clone(),
            ResourceDescription {
                resource_id: id.clone(),
                state: ResourceState::Running,
                attachments: 0,
            },
        );
        Ok(id)
    }

    async fn release_resource(
        &self,
        resource_id: &str,
        resource_type: ResourceType,
    ) -> Result<(), CloudError> {
        let mut sim = self.lock();

        if sim.failing_releases.contains(resource_id) {
            return Err(CloudError::rejected(
                ErrorCode::TeardownFailed,
                format!("{} {} is still in use", resource_type, resource_id),
            ));
        }

        if let Some(desc) = sim.resources.get_mut(resource_id) {
            desc.state = ResourceState::Terminated;
            desc.attachments = 0;
        }
        sim.releases.push((resource_id.to_string(), resource_type));
        Ok(())
    }

    async fn describe_resource(&self, resource_id: &str) -> Result<ResourceDescription, CloudError> {
        let latency = self.lock().describe_latency.get(resource_id).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        Ok(self
            .lock()
            .resources
            .get(resource_id)
            .cloned()
            .unwrap_or_else(|| ResourceDescription::not_found(resource_id)))
    }

    async fn probe_service_endpoint(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Duration, CloudError> {
        let behavior = self.lock().endpoints.get(url).cloned();

        let Some(behavior) = behavior else {
            return Err(CloudError::Transport(format!("{}: connection refused", url)));
        };

        if behavior.latency > timeout {
            tokio::time::sleep(timeout).await;
            return Err(CloudError::Timeout(timeout));
        }

        tokio::time::sleep(behavior.latency).await;

        if behavior.healthy {
            Ok(behavior.latency)
        } else {
            Err(CloudError::rejected(
                ErrorCode::EndpointUnreachable,
                format!("{} answered 503", url),
            ))
        }
    }
}
