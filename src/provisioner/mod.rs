/// Capacity provisioner
///
/// Walks a `FallbackMatrix` in priority order until one candidate yields an
/// allocation:
///
/// ```text
/// Pending → Requesting(candidate) → Allocated
///                                 → Rejected(code) → classify → next / retry / stop
/// ```
///
/// Successful allocations are registered before they are reported to the
/// caller. Rejections go through the `ErrorEngine`; the bound recovery
/// strategy decides what happens next.
pub mod matrix;

pub use matrix::{instance_spec, DesiredShape, FallbackCandidate, FallbackMatrix, InstanceSpec};

use crate::cloud::{AllocationRequest, CloudCapability, CloudError, ResourceState};
use crate::error::{
    with_retry, ErrorCode, ErrorContext, ErrorEngine, RecoveryStrategy, RetryPolicy,
};
use crate::registry::{RegistryError, ResourceRecord, ResourceRegistry, TeardownAction};
use crate::ResourceType;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// One rejected request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub candidate: FallbackCandidate,
    pub code: ErrorCode,
    pub strategy: RecoveryStrategy,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Every candidate was tried and none yielded capacity
#[derive(Debug, Clone, Error)]
#[error("No capacity for stack {stack_id} after {} attempts", .attempts.len())]
pub struct ExhaustedError {
    pub stack_id: String,
    pub attempts: Vec<AttemptRecord>,
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error(transparent)]
    Exhausted(ExhaustedError),

    /// A rejection whose strategy forbids moving on (credentials, config,
    /// a ledger conflict...)
    #[error("Provisioning stopped at {candidate}: {code}: {message}")]
    Fatal {
        code: ErrorCode,
        candidate: FallbackCandidate,
        message: String,
        attempts: Vec<AttemptRecord>,
    },

    #[error("Provisioning deadline exceeded for stack {stack_id} after {} attempts", .attempts.len())]
    DeadlineExceeded {
        stack_id: String,
        attempts: Vec<AttemptRecord>,
    },

    #[error("Provisioning cancelled for stack {stack_id} after {} attempts", .attempts.len())]
    Cancelled {
        stack_id: String,
        attempts: Vec<AttemptRecord>,
    },
}

impl ProvisionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProvisionError::Exhausted(e) => e
                .attempts
                .last()
                .map(|a| a.code.clone())
                .unwrap_or(ErrorCode::CapacityExhausted),
            ProvisionError::Fatal { code, .. } => code.clone(),
            ProvisionError::DeadlineExceeded { .. } => ErrorCode::OperationTimeout,
            ProvisionError::Cancelled { .. } => ErrorCode::Other("provisioning-cancelled".to_string()),
        }
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            ProvisionError::Exhausted(e) => &e.attempts,
            ProvisionError::Fatal { attempts, .. } => attempts,
            ProvisionError::DeadlineExceeded { attempts, .. } => attempts,
            ProvisionError::Cancelled { attempts, .. } => attempts,
        }
    }

    /// Manual-strategy failures must be surfaced, never rolled past
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProvisionError::Fatal { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationResult {
    pub stack_id: String,
    pub resource_id: String,
    pub candidate: FallbackCandidate,

    /// Rejections seen on the way
    pub attempts: Vec<AttemptRecord>,

    /// True when an existing healthy allocation was returned
    pub reused: bool,
}

impl fmt::Display for AllocationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {}{}",
            self.resource_id,
            self.candidate,
            if self.reused { " (existing)" } else { "" }
        )
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    /// Upper bound on concurrent diversified requests
    pub concurrency_cap: usize,

    /// Bound on one allocate call
    pub attempt_timeout: Duration,

    /// Bound on a whole attempt cycle
    pub cycle_deadline: Duration,

    /// Backoff for retry-strategy rejections (timeouts, dependencies)
    pub retry: RetryPolicy,

    /// Release the allocations a failed or cancelled cycle registered.
    /// When off they stay registered for a later teardown.
    pub unwind_on_failure: bool,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            concurrency_cap: num_cpus::get().clamp(2, 8),
            attempt_timeout: Duration::from_secs(60),
            cycle_deadline: Duration::from_secs(900),
            retry: RetryPolicy::default(),
            unwind_on_failure: true,
        }
    }
}

/// Why one candidate did not produce an allocation
#[derive(Debug, Clone)]
struct CandidateFailure {
    code: ErrorCode,
    strategy: RecoveryStrategy,
    message: String,
}

enum GroupOutcome {
    Allocated(FallbackCandidate, String),
    Stop(ErrorCode, FallbackCandidate, String),
    Continue,
}

/// What one attempt cycle did so far. Outlives the cycle future, so a
/// deadline or cancellation still sees every rejection and every
/// allocation that was already registered.
#[derive(Default)]
struct CycleLog {
    attempts: Mutex<Vec<AttemptRecord>>,

    /// Registered allocations not yet released, in registration order
    allocated: Mutex<Vec<(FallbackCandidate, String)>>,
}

impl CycleLog {
    fn attempts(&self) -> Vec<AttemptRecord> {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn allocated(&self) -> Vec<(FallbackCandidate, String)> {
        self.allocated.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push_allocation(&self, candidate: &FallbackCandidate, resource_id: &str) {
        self.allocated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((candidate.clone(), resource_id.to_string()));
    }

    fn forget(&self, resource_id: &str) {
        self.allocated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(_, id)| id != resource_id);
    }
}

enum Interrupted {
    Deadline,
    Cancelled,
}

pub struct Provisioner {
    cloud: Arc<dyn CloudCapability>,
    registry: Arc<ResourceRegistry>,
    engine: Arc<ErrorEngine>,
    settings: ProvisionerSettings,
}

impl Provisioner {
    pub fn new(
        cloud: Arc<dyn CloudCapability>,
        registry: Arc<ResourceRegistry>,
        engine: Arc<ErrorEngine>,
        settings: ProvisionerSettings,
    ) -> Self {
        Self {
            cloud,
            registry,
            engine,
            settings,
        }
    }

    pub fn settings(&self) -> &ProvisionerSettings {
        &self.settings
    }

    /// Provision compute for a stack within the configured cycle deadline
    pub async fn provision(
        &self,
        stack_id: &str,
        shape: &DesiredShape,
        matrix: &FallbackMatrix,
    ) -> Result<AllocationResult, ProvisionError> {
        let deadline = Instant::now() + self.settings.cycle_deadline;
        self.provision_until(stack_id, shape, matrix, deadline).await
    }

    /// Provision compute for a stack, giving up at `deadline`
    pub async fn provision_until(
        &self,
        stack_id: &str,
        shape: &DesiredShape,
        matrix: &FallbackMatrix,
        deadline: Instant,
    ) -> Result<AllocationResult, ProvisionError> {
        self.provision_cancellable(stack_id, shape, matrix, deadline, std::future::pending())
            .await
    }

    /// Provision compute for a stack until `deadline` or until `cancel`
    /// resolves, whichever comes first.
    ///
    /// Every allocation is registered the moment the provider returns it, so
    /// an interrupted cycle never loses one. Requests still in flight are
    /// abandoned. On a deadline the first registered allocation, if any,
    /// still wins; on cancellation or failure the allocations this cycle
    /// registered are released (see `ProvisionerSettings::unwind_on_failure`).
    /// Resources the stack owned before the call are never touched.
    pub async fn provision_cancellable<C>(
        &self,
        stack_id: &str,
        shape: &DesiredShape,
        matrix: &FallbackMatrix,
        deadline: Instant,
        cancel: C,
    ) -> Result<AllocationResult, ProvisionError>
    where
        C: Future<Output = ()>,
    {
        if let Some(existing) = self.existing_allocation(stack_id).await {
            tracing::info!(
                stack_id,
                resource_id = %existing.resource_id,
                "Stack already has a healthy allocation"
            );
            return Ok(existing);
        }

        let log = CycleLog::default();
        let outcome = {
            let cycle = self.run_cycle(stack_id, shape, matrix, &log);
            tokio::pin!(cycle);
            tokio::pin!(cancel);
            tokio::select! {
                outcome = &mut cycle => Ok(outcome),
                _ = tokio::time::sleep_until(deadline) => Err(Interrupted::Deadline),
                _ = &mut cancel => Err(Interrupted::Cancelled),
            }
        };
        let attempts = log.attempts();

        match outcome {
            Err(Interrupted::Deadline) => {
                let mut allocated = log.allocated().into_iter();
                if let Some((candidate, resource_id)) = allocated.next() {
                    tracing::warn!(
                        stack_id,
                        resource_id = %resource_id,
                        "Deadline reached with an allocation in hand, abandoning in-flight requests"
                    );
                    let surplus: Vec<String> = allocated.map(|(_, id)| id).collect();
                    self.release_allocations(stack_id, &surplus, &log).await;
                    return Ok(self.allocated(stack_id, candidate, resource_id, attempts));
                }

                self.engine.record(
                    ErrorCode::OperationTimeout,
                    &ErrorContext::new("provision").with_stack(stack_id),
                );
                Err(ProvisionError::DeadlineExceeded {
                    stack_id: stack_id.to_string(),
                    attempts,
                })
            }
            Err(Interrupted::Cancelled) => {
                tracing::warn!(stack_id, "Provisioning cancelled");
                self.unwind(stack_id, &log).await;
                Err(ProvisionError::Cancelled {
                    stack_id: stack_id.to_string(),
                    attempts,
                })
            }
            Ok(GroupOutcome::Allocated(candidate, resource_id)) => {
                Ok(self.allocated(stack_id, candidate, resource_id, attempts))
            }
            Ok(GroupOutcome::Stop(code, candidate, message)) => {
                tracing::error!(stack_id, code = %code, candidate = %candidate, "Provisioning stopped");
                self.unwind(stack_id, &log).await;
                Err(ProvisionError::Fatal {
                    code,
                    candidate,
                    message,
                    attempts,
                })
            }
            Ok(GroupOutcome::Continue) => {
                self.escalate(&attempts);
                tracing::error!(stack_id, attempts = attempts.len(), "Fallback matrix exhausted");
                self.unwind(stack_id, &log).await;
                Err(ProvisionError::Exhausted(ExhaustedError {
                    stack_id: stack_id.to_string(),
                    attempts,
                }))
            }
        }
    }

    fn allocated(
        &self,
        stack_id: &str,
        candidate: FallbackCandidate,
        resource_id: String,
        attempts: Vec<AttemptRecord>,
    ) -> AllocationResult {
        tracing::info!(
            stack_id,
            resource_id = %resource_id,
            candidate = %candidate,
            rejections = attempts.len(),
            "Allocated compute"
        );
        AllocationResult {
            stack_id: stack_id.to_string(),
            resource_id,
            candidate,
            attempts,
            reused: false,
        }
    }

    /// Release what a failed cycle registered
    async fn unwind(&self, stack_id: &str, log: &CycleLog) {
        let ids: Vec<String> = log.allocated().into_iter().map(|(_, id)| id).collect();
        if ids.is_empty() {
            return;
        }
        if !self.settings.unwind_on_failure {
            tracing::warn!(stack_id, resources = ids.len(), "Leaving partial allocations registered");
            return;
        }
        tracing::warn!(stack_id, resources = ids.len(), "Releasing partial allocations");
        self.release_allocations(stack_id, &ids, log).await;
    }

    /// Released ids leave the registry; ids whose release fails stay
    /// registered for a later teardown
    async fn release_allocations(&self, stack_id: &str, ids: &[String], log: &CycleLog) {
        if ids.is_empty() {
            return;
        }
        let summary = self.registry.release(stack_id, ids, self.cloud.as_ref()).await;
        for record in &summary.released {
            log.forget(&record.resource_id);
        }
        for failure in &summary.failed {
            tracing::warn!(
                resource_id = %failure.resource_id,
                reason = %failure.reason,
                "Allocation release failed, kept for teardown"
            );
        }
    }

    /// Healthy compute already registered for this stack
    async fn existing_allocation(&self, stack_id: &str) -> Option<AllocationResult> {
        for record in self.registry.find(stack_id, ResourceType::Compute) {
            let describe = self.cloud.describe_resource(&record.resource_id);
            let state = match tokio::time::timeout(self.settings.attempt_timeout, describe).await {
                Ok(Ok(desc)) => desc.state,
                Ok(Err(e)) => {
                    tracing::debug!(resource_id = %record.resource_id, error = %e, "Describe failed");
                    continue;
                }
                Err(_) => continue,
            };

            if state == ResourceState::Running {
                let candidate = FallbackCandidate::new(
                    record.meta("instance_class").unwrap_or("unknown"),
                    record.meta("region").unwrap_or("unknown"),
                    record
                        .meta("priority")
                        .and_then(|p| p.parse().ok())
                        .unwrap_or(0),
                );
                return Some(AllocationResult {
                    stack_id: stack_id.to_string(),
                    resource_id: record.resource_id,
                    candidate,
                    attempts: Vec::new(),
                    reused: true,
                });
            }
        }
        None
    }

    async fn run_cycle(
        &self,
        stack_id: &str,
        shape: &DesiredShape,
        matrix: &FallbackMatrix,
        log: &CycleLog,
    ) -> GroupOutcome {
        for group in matrix.priority_groups() {
            let concurrent = group.len() > 1 && group.iter().all(|c| c.diversified);

            let outcome = if concurrent {
                self.try_concurrent(stack_id, shape, group, log).await
            } else {
                self.try_sequential(stack_id, shape, group, log).await
            };

            if !matches!(outcome, GroupOutcome::Continue) {
                return outcome;
            }
        }
        GroupOutcome::Continue
    }

    async fn try_sequential(
        &self,
        stack_id: &str,
        shape: &DesiredShape,
        group: &[FallbackCandidate],
        log: &CycleLog,
    ) -> GroupOutcome {
        for candidate in group {
            match self.try_candidate(stack_id, shape, candidate, log).await {
                Ok(resource_id) => return GroupOutcome::Allocated(candidate.clone(), resource_id),
                Err(failure) if stops_cycle(failure.strategy) => {
                    return GroupOutcome::Stop(failure.code, candidate.clone(), failure.message)
                }
                Err(_) => continue,
            }
        }
        GroupOutcome::Continue
    }

    /// Equal-priority diversified candidates, up to the concurrency cap.
    /// The first allocation wins; any extra ones are released.
    async fn try_concurrent(
        &self,
        stack_id: &str,
        shape: &DesiredShape,
        group: &[FallbackCandidate],
        log: &CycleLog,
    ) -> GroupOutcome {
        tracing::debug!(
            stack_id,
            candidates = group.len(),
            cap = self.settings.concurrency_cap,
            "Trying diversified candidates concurrently"
        );

        let results: Vec<(FallbackCandidate, Result<String, CandidateFailure>)> =
            stream::iter(group.iter())
                .map(|candidate| async move {
                    let result = self.try_candidate(stack_id, shape, candidate, log).await;
                    (candidate.clone(), result)
                })
                .buffer_unordered(self.settings.concurrency_cap.max(1))
                .collect()
                .await;

        // Registration order decides the winner, the same rule a deadline uses
        let winner = log.allocated().into_iter().next();
        let mut stop: Option<(ErrorCode, FallbackCandidate, String)> = None;
        let mut surplus: Vec<String> = Vec::new();

        for (candidate, result) in results {
            match result {
                Ok(resource_id) => {
                    if winner.as_ref().map(|(_, id)| id) != Some(&resource_id) {
                        tracing::info!(stack_id, resource_id = %resource_id, candidate = %candidate, "Releasing surplus allocation");
                        surplus.push(resource_id);
                    }
                }
                Err(failure) if stops_cycle(failure.strategy) => {
                    if stop.is_none() {
                        stop = Some((failure.code, candidate, failure.message));
                    }
                }
                Err(_) => {}
            }
        }
        self.release_allocations(stack_id, &surplus, log).await;

        match (winner, stop) {
            (Some((candidate, resource_id)), _) => GroupOutcome::Allocated(candidate, resource_id),
            (None, Some((code, candidate, message))) => GroupOutcome::Stop(code, candidate, message),
            (None, None) => GroupOutcome::Continue,
        }
    }

    /// Request one candidate, retrying in place while the bound strategy
    /// says retry and the budget allows. A returned allocation is already
    /// registered.
    async fn try_candidate(
        &self,
        stack_id: &str,
        shape: &DesiredShape,
        candidate: &FallbackCandidate,
        log: &CycleLog,
    ) -> Result<String, CandidateFailure> {
        let request = AllocationRequest {
            stack_id: stack_id.to_string(),
            instance_class: candidate.instance_class.clone(),
            region: candidate.region.clone(),
            interruptible: shape.interruptible,
            max_spot_price: if shape.interruptible {
                shape.max_spot_price
            } else {
                None
            },
        };
        let max_retries = self.settings.retry.max_retries;

        let resource_id = with_retry(
            &self.settings.retry,
            |attempt| {
                let request = &request;
                async move {
                    tracing::debug!(candidate = %candidate, attempt, "Requesting capacity");

                    let call = self.cloud.allocate_compute(request);
                    let result = match tokio::time::timeout(self.settings.attempt_timeout, call).await {
                        Ok(result) => result,
                        Err(_) => Err(CloudError::Timeout(self.settings.attempt_timeout)),
                    };

                    result.map_err(|e| self.reject(stack_id, candidate, e, log))
                }
            },
            |failure: &CandidateFailure| {
                failure.strategy == RecoveryStrategy::Retry
                    && self.engine.should_retry(&failure.code, max_retries + 1)
            },
        )
        .await?;

        // No await between the provider answer and this registration
        let record = ResourceRecord::new(
            resource_id.as_str(),
            ResourceType::Compute,
            stack_id,
            TeardownAction::Release,
        )
        .with_metadata("instance_class", candidate.instance_class.as_str())
        .with_metadata("region", candidate.region.as_str())
        .with_metadata("priority", candidate.priority.to_string())
        .with_metadata("interruptible", shape.interruptible.to_string());

        match self.registry.register_record(record) {
            Ok(_) => {
                log.push_allocation(candidate, &resource_id);
                Ok(resource_id)
            }
            Err(e) => Err(self.untracked(stack_id, candidate, &resource_id, e).await),
        }
    }

    /// Never hand out a resource the registry refused
    async fn untracked(
        &self,
        stack_id: &str,
        candidate: &FallbackCandidate,
        resource_id: &str,
        error: RegistryError,
    ) -> CandidateFailure {
        let code = error.code();
        tracing::error!(stack_id, resource_id, error = %error, "Allocation could not be registered");

        if let Err(release_err) = self
            .cloud
            .release_resource(resource_id, ResourceType::Compute)
            .await
        {
            tracing::error!(
                resource_id,
                error = %release_err,
                "Failed to release unregistered allocation"
            );
        }

        let ctx = ErrorContext::for_candidate(stack_id, &candidate.instance_class, &candidate.region)
            .with_metadata("resource_id", resource_id);
        self.engine
            .classify(code.clone(), &ctx, None, Some(RecoveryStrategy::Abort));

        CandidateFailure {
            code,
            strategy: RecoveryStrategy::Abort,
            message: error.to_string(),
        }
    }

    fn reject(
        &self,
        stack_id: &str,
        candidate: &FallbackCandidate,
        error: CloudError,
        log: &CycleLog,
    ) -> CandidateFailure {
        let code = error.code();
        let ctx = ErrorContext::for_candidate(stack_id, &candidate.instance_class, &candidate.region)
            .with_metadata("priority", candidate.priority.to_string());
        let event = self.engine.record(code.clone(), &ctx);

        let message = match &error {
            CloudError::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        };

        log.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(AttemptRecord {
                candidate: candidate.clone(),
                code: code.clone(),
                strategy: event.recovery_strategy,
                message: message.clone(),
                timestamp: event.timestamp,
            });

        CandidateFailure {
            code,
            strategy: event.recovery_strategy,
            message,
        }
    }

    /// Infrastructure/network codes escalate to manual once every fallback
    /// candidate is spent
    fn escalate(&self, attempts: &[AttemptRecord]) {
        let mut seen: Vec<&ErrorCode> = Vec::new();
        for attempt in attempts {
            if seen.contains(&&attempt.code) {
                continue;
            }
            seen.push(&attempt.code);

            let (category, _, _) = attempt.code.defaults();
            if category.escalates_after_fallback() {
                self.engine
                    .override_strategy(&attempt.code, RecoveryStrategy::Manual);
            }
        }
    }
}

fn stops_cycle(strategy: RecoveryStrategy) -> bool {
    matches!(strategy, RecoveryStrategy::Abort | RecoveryStrategy::Manual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::SimulatedCloud;

    fn settings() -> ProvisionerSettings {
        ProvisionerSettings {
            concurrency_cap: 4,
            attempt_timeout: Duration::from_secs(10),
            cycle_deadline: Duration::from_secs(10),
            retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5)),
            unwind_on_failure: true,
        }
    }

    fn setup(cloud: Arc<SimulatedCloud>) -> (Provisioner, Arc<ResourceRegistry>, Arc<ErrorEngine>) {
        setup_with(cloud, settings())
    }

    fn setup_with(
        cloud: Arc<SimulatedCloud>,
        settings: ProvisionerSettings,
    ) -> (Provisioner, Arc<ResourceRegistry>, Arc<ErrorEngine>) {
        let engine = Arc::new(ErrorEngine::new());
        let registry = Arc::new(ResourceRegistry::new(Arc::clone(&engine)));
        let provisioner = Provisioner::new(cloud, Arc::clone(&registry), Arc::clone(&engine), settings);
        (provisioner, registry, engine)
    }

    #[tokio::test]
    async fn test_credentials_failure_stops_immediately() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.reject("g4dn.xlarge", "us-east-1", ErrorCode::InvalidCredentials);
        let (provisioner, registry, _) = setup(Arc::clone(&cloud));

        let matrix = FallbackMatrix::ordered(&[("g4dn.xlarge", "us-east-1"), ("g5g.xlarge", "us-east-1")]);
        let err = provisioner
            .provision("ai-stack", &DesiredShape::default(), &matrix)
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(err.code(), ErrorCode::InvalidCredentials);
        assert_eq!(cloud.allocation_count(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_timeouts_retry_same_candidate() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.reject_times("g4dn.xlarge", "us-east-1", ErrorCode::OperationTimeout, 2);
        let (provisioner, _, engine) = setup(Arc::clone(&cloud));

        let matrix = FallbackMatrix::ordered(&[("g4dn.xlarge", "us-east-1"), ("g5g.xlarge", "us-east-1")]);
        let result = provisioner
            .provision("ai-stack", &DesiredShape::default(), &matrix)
            .await
            .unwrap();

        assert_eq!(result.candidate.instance_class, "g4dn.xlarge");
        assert_eq!(result.attempts.len(), 2);
        assert_eq!(engine.occurrences(&ErrorCode::OperationTimeout), 2);
        assert_eq!(cloud.allocation_count(), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_escalates_network_codes() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.reject("g4dn.xlarge", "us-east-1", ErrorCode::NetworkNotFound);
        cloud.reject("g4dn.xlarge", "us-west-2", ErrorCode::CapacityExhausted);
        let (provisioner, _, engine) = setup(cloud);

        let matrix = FallbackMatrix::ordered(&[("g4dn.xlarge", "us-east-1"), ("g4dn.xlarge", "us-west-2")]);
        let err = provisioner
            .provision("ai-stack", &DesiredShape::default(), &matrix)
            .await
            .unwrap_err();

        match &err {
            ProvisionError::Exhausted(e) => {
                assert_eq!(e.attempts.len(), 2);
                assert_eq!(e.attempts[0].code, ErrorCode::NetworkNotFound);
                assert_eq!(e.attempts[1].candidate.region, "us-west-2");
            }
            other => panic!("expected exhaustion, got {other}"),
        }
        assert_eq!(
            engine.strategy_for(&ErrorCode::NetworkNotFound),
            Some(RecoveryStrategy::Manual)
        );
        assert_eq!(
            engine.strategy_for(&ErrorCode::CapacityExhausted),
            Some(RecoveryStrategy::Fallback)
        );
    }

    #[tokio::test]
    async fn test_diversified_group_keeps_one_allocation() {
        let cloud = Arc::new(SimulatedCloud::new());
        let (provisioner, registry, _) = setup(Arc::clone(&cloud));

        let matrix = FallbackMatrix::new(vec![
            FallbackCandidate::new("g4dn.xlarge", "us-west-2", 100).diversified(),
            FallbackCandidate::new("g4dn.xlarge", "eu-west-1", 100).diversified(),
        ]);
        let result = provisioner
            .provision("ai-stack", &DesiredShape::default(), &matrix)
            .await
            .unwrap();

        assert_eq!(cloud.allocation_count(), 2);
        assert_eq!(cloud.released().len(), 1);
        let compute = registry.find("ai-stack", ResourceType::Compute);
        assert_eq!(compute.len(), 1);
        assert_eq!(compute[0].resource_id, result.resource_id);
    }

    #[tokio::test]
    async fn test_deadline_abandons_inflight_requests() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.set_allocation_latency(Duration::from_millis(500));
        let (provisioner, registry, _) = setup(Arc::clone(&cloud));

        let matrix = FallbackMatrix::ordered(&[("g4dn.xlarge", "us-east-1")]);
        let deadline = Instant::now() + Duration::from_millis(50);
        let err = provisioner
            .provision_until("ai-stack", &DesiredShape::default(), &matrix, deadline)
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::DeadlineExceeded { .. }));
        assert_eq!(err.code(), ErrorCode::OperationTimeout);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_empty_matrix_is_exhausted() {
        let cloud = Arc::new(SimulatedCloud::new());
        let (provisioner, _, _) = setup(cloud);

        let err = provisioner
            .provision("ai-stack", &DesiredShape::default(), &FallbackMatrix::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Exhausted(_)));
        assert_eq!(err.code(), ErrorCode::CapacityExhausted);
    }

    fn fast_and_slow_regions(cloud: &SimulatedCloud) -> FallbackMatrix {
        cloud.set_region_latency("eu-west-1", Duration::from_secs(5));
        FallbackMatrix::new(vec![
            FallbackCandidate::new("g4dn.xlarge", "us-west-2", 0).diversified(),
            FallbackCandidate::new("g4dn.xlarge", "eu-west-1", 0).diversified(),
        ])
    }

    #[tokio::test]
    async fn test_deadline_keeps_allocation_from_fast_sibling() {
        let cloud = Arc::new(SimulatedCloud::new());
        let matrix = fast_and_slow_regions(&cloud);
        let (provisioner, registry, _) = setup(Arc::clone(&cloud));

        let deadline = Instant::now() + Duration::from_millis(300);
        let result = provisioner
            .provision_until("ai-stack", &DesiredShape::default(), &matrix, deadline)
            .await
            .unwrap();

        assert_eq!(result.candidate.region, "us-west-2");
        let compute = registry.find("ai-stack", ResourceType::Compute);
        assert_eq!(compute.len(), 1);
        assert_eq!(compute[0].resource_id, result.resource_id);
        assert!(cloud.released().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_releases_only_this_cycles_allocations() {
        let cloud = Arc::new(SimulatedCloud::new());
        let matrix = fast_and_slow_regions(&cloud);
        let (provisioner, registry, _) = setup(Arc::clone(&cloud));
        registry
            .register("vpc-1", ResourceType::Network, "ai-stack", TeardownAction::Release)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let cancel = tokio::time::sleep(Duration::from_millis(300));
        let err = provisioner
            .provision_cancellable("ai-stack", &DesiredShape::default(), &matrix, deadline, cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Cancelled { .. }));
        let released = cloud.released();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].1, ResourceType::Compute);
        assert!(registry.find("ai-stack", ResourceType::Compute).is_empty());
        assert!(registry.lookup("vpc-1").is_some());
    }

    #[tokio::test]
    async fn test_cancel_without_unwind_keeps_allocation_registered() {
        let cloud = Arc::new(SimulatedCloud::new());
        let matrix = fast_and_slow_regions(&cloud);
        let mut settings = settings();
        settings.unwind_on_failure = false;
        let (provisioner, registry, _) = setup_with(Arc::clone(&cloud), settings);

        let deadline = Instant::now() + Duration::from_secs(10);
        let cancel = tokio::time::sleep(Duration::from_millis(300));
        let err = provisioner
            .provision_cancellable("ai-stack", &DesiredShape::default(), &matrix, deadline, cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Cancelled { .. }));
        assert!(cloud.released().is_empty());
        assert_eq!(registry.find("ai-stack", ResourceType::Compute).len(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_leaves_prior_resources_alone() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.set_market_price(5.0);
        let (provisioner, registry, _) = setup(Arc::clone(&cloud));
        registry
            .register("vol-1", ResourceType::Storage, "ai-stack", TeardownAction::Release)
            .unwrap();

        let matrix = FallbackMatrix::ordered(&[("g4dn.xlarge", "us-east-1"), ("g4dn.xlarge", "us-west-2")]);
        let err = provisioner
            .provision("ai-stack", &DesiredShape::default(), &matrix)
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::SpotBidTooLow);
        assert!(cloud.released().is_empty());
        assert!(registry.lookup("vol-1").is_some());
    }
}
