/// Resource registry - ledger of everything a stack owns
///
/// Every allocated resource is registered together with the exact action
/// that reverses it. Teardown walks a stack's records in reverse-dependency
/// order (see `ResourceType::teardown_rank`), never in registration order.
/// Registry writes are linearized behind one mutex; the mutex is never held
/// across a provider call.
pub mod ledger;

pub use ledger::{LedgerStats, ResourceLedger};

use crate::cloud::CloudCapability;
use crate::error::{ErrorCode, ErrorContext, ErrorEngine, RecoveryStrategy};
use crate::ResourceType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Default bound on one teardown action
const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Resource {resource_id} is already registered to stack {existing_stack} (requested by {requested_stack})")]
    DuplicateResource {
        resource_id: String,
        existing_stack: String,
        requested_stack: String,
    },

    #[error("Ledger store failure: {0}")]
    Store(String),
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::DuplicateResource { .. } => ErrorCode::ResourceConflict,
            RegistryError::Store(_) => ErrorCode::Other("ledger-store-failure".to_string()),
        }
    }
}

/// How to reverse one allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TeardownAction {
    /// Ask the provider to release the resource
    Release,

    /// Run an external reversal command
    Command { program: String, args: Vec<String> },

    /// Nothing to undo (e.g. resources removed together with their parent)
    Noop,
}

impl fmt::Display for TeardownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownAction::Release => f.write_str("release"),
            TeardownAction::Command { program, args } => {
                write!(f, "command `{}", program)?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                f.write_str("`")
            }
            TeardownAction::Noop => f.write_str("noop"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Provider-assigned id
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub stack_id: String,
    pub teardown_action: TeardownAction,

    /// Free-form facts (instance class, region, endpoint...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,
}

impl ResourceRecord {
    pub fn new(
        resource_id: impl Into<String>,
        resource_type: ResourceType,
        stack_id: impl Into<String>,
        teardown_action: TeardownAction,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_type,
            stack_id: stack_id.into(),
            teardown_action,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownFailure {
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub code: ErrorCode,
    pub reason: String,
}

/// Outcome of unwinding one stack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownSummary {
    pub stack_id: String,

    /// Released resources, in the order they were released
    pub released: Vec<ResourceRecord>,

    pub failed: Vec<TeardownFailure>,
}

impl TeardownSummary {
    /// Complete only when nothing failed
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct RegistryInner {
    // Registration order
    records: Vec<ResourceRecord>,
    ledger: Option<ResourceLedger>,
}

pub struct ResourceRegistry {
    inner: Mutex<RegistryInner>,
    engine: Arc<ErrorEngine>,
    action_timeout: Duration,
}

impl ResourceRegistry {
    /// In-memory registry
    pub fn new(engine: Arc<ErrorEngine>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                records: Vec::new(),
                ledger: None,
            }),
            engine,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
        }
    }

    /// Registry persisted to a SQLite ledger; unreclaimed records are reloaded
    pub fn open(db_path: &Path, engine: Arc<ErrorEngine>) -> Result<Self, RegistryError> {
        let ledger = ResourceLedger::open(db_path).map_err(|e| RegistryError::Store(format!("{:#}", e)))?;
        let records = ledger
            .load_active()
            .map_err(|e| RegistryError::Store(format!("{:#}", e)))?;

        if !records.is_empty() {
            tracing::info!(
                ledger = %db_path.display(),
                active = records.len(),
                "Reloaded active resources from ledger"
            );
        }

        Ok(Self {
            inner: Mutex::new(RegistryInner {
                records,
                ledger: Some(ledger),
            }),
            engine,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
        })
    }

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn engine(&self) -> &Arc<ErrorEngine> {
        &self.engine
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(
        &self,
        resource_id: impl Into<String>,
        resource_type: ResourceType,
        stack_id: impl Into<String>,
        teardown_action: TeardownAction,
    ) -> Result<ResourceRecord, RegistryError> {
        self.register_record(ResourceRecord::new(
            resource_id,
            resource_type,
            stack_id,
            teardown_action,
        ))
    }

    /// Register a resource
    ///
    /// Re-registering an id for the same stack is a no-op returning the
    /// existing record; registering it for a different stack fails.
    pub fn register_record(&self, record: ResourceRecord) -> Result<ResourceRecord, RegistryError> {
        let mut inner = self.lock();

        if let Some(existing) = inner
            .records
            .iter()
            .find(|r| r.resource_id == record.resource_id)
        {
            if existing.stack_id == record.stack_id {
                return Ok(existing.clone());
            }

            let err = RegistryError::DuplicateResource {
                resource_id: record.resource_id.clone(),
                existing_stack: existing.stack_id.clone(),
                requested_stack: record.stack_id.clone(),
            };
            drop(inner);

            self.engine.record(
                err.code(),
                &ErrorContext::new("register_resource")
                    .with_stack(record.stack_id.as_str())
                    .with_metadata("resource_id", record.resource_id.as_str()),
            );
            return Err(err);
        }

        if let Some(ledger) = inner.ledger.as_mut() {
            ledger
                .insert(&record)
                .map_err(|e| RegistryError::Store(format!("{:#}", e)))?;
        }

        tracing::debug!(
            resource_id = %record.resource_id,
            resource_type = %record.resource_type,
            stack_id = %record.stack_id,
            teardown = %record.teardown_action,
            "Registered resource"
        );

        inner.records.push(record.clone());
        Ok(record)
    }

    pub fn lookup(&self, resource_id: &str) -> Option<ResourceRecord> {
        self.lock()
            .records
            .iter()
            .find(|r| r.resource_id == resource_id)
            .cloned()
    }

    /// Records of a stack in teardown order
    ///
    /// Sorted by resource-type rank; records of equal rank come out in
    /// reverse registration order.
    pub fn list_by_stack(&self, stack_id: &str) -> Vec<ResourceRecord> {
        let mut records: Vec<ResourceRecord> = self
            .lock()
            .records
            .iter()
            .rev()
            .filter(|r| r.stack_id == stack_id)
            .cloned()
            .collect();

        // Stable sort keeps the reversed registration order within a rank
        records.sort_by_key(|r| r.resource_type.teardown_rank());
        records
    }

    /// Records of one type for a stack, in registration order
    pub fn find(&self, stack_id: &str, resource_type: ResourceType) -> Vec<ResourceRecord> {
        self.lock()
            .records
            .iter()
            .filter(|r| r.stack_id == stack_id && r.resource_type == resource_type)
            .cloned()
            .collect()
    }

    pub fn stacks(&self) -> Vec<String> {
        let mut stacks: Vec<String> = self
            .lock()
            .records
            .iter()
            .map(|r| r.stack_id.clone())
            .collect();
        stacks.sort();
        stacks.dedup();
        stacks
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn ledger_stats(&self) -> Option<LedgerStats> {
        let inner = self.lock();
        inner.ledger.as_ref().and_then(|l| l.stats().ok())
    }

    /// Unwind a stack
    ///
    /// A failing entry is classified (skip) and reported; the walk continues
    /// with the next entry. Failed entries stay registered so a later
    /// teardown can retry them.
    pub async fn teardown_stack(
        &self,
        stack_id: &str,
        cloud: &dyn CloudCapability,
    ) -> TeardownSummary {
        let plan = self.list_by_stack(stack_id);
        tracing::info!(stack_id, resources = plan.len(), "Tearing down stack");
        self.unwind(stack_id, plan, cloud).await
    }

    /// Release only the named resources of a stack, in teardown order.
    /// Ids that are not registered to the stack are ignored.
    pub async fn release(
        &self,
        stack_id: &str,
        resource_ids: &[String],
        cloud: &dyn CloudCapability,
    ) -> TeardownSummary {
        let plan: Vec<ResourceRecord> = self
            .list_by_stack(stack_id)
            .into_iter()
            .filter(|r| resource_ids.contains(&r.resource_id))
            .collect();
        tracing::debug!(stack_id, resources = plan.len(), "Releasing selected resources");
        self.unwind(stack_id, plan, cloud).await
    }

    async fn unwind(
        &self,
        stack_id: &str,
        plan: Vec<ResourceRecord>,
        cloud: &dyn CloudCapability,
    ) -> TeardownSummary {
        let mut summary = TeardownSummary {
            stack_id: stack_id.to_string(),
            released: Vec::new(),
            failed: Vec::new(),
        };

        for record in plan {
            match self.execute_action(&record, cloud).await {
                Ok(()) => {
                    self.mark_reclaimed(&record.resource_id);
                    tracing::info!(
                        resource_id = %record.resource_id,
                        resource_type = %record.resource_type,
                        "Released resource"
                    );
                    summary.released.push(record);
                }
                Err((code, reason)) => {
                    let ctx = ErrorContext::new("teardown")
                        .with_stack(stack_id)
                        .with_metadata("resource_id", record.resource_id.as_str())
                        .with_metadata("resource_type", record.resource_type.as_str())
                        .with_metadata("cause", code.as_str());
                    self.engine.classify(
                        ErrorCode::TeardownFailed,
                        &ctx,
                        None,
                        Some(RecoveryStrategy::Skip),
                    );

                    summary.failed.push(TeardownFailure {
                        resource_id: record.resource_id.clone(),
                        resource_type: record.resource_type,
                        code,
                        reason,
                    });
                }
            }
        }

        if summary.is_complete() {
            tracing::info!(stack_id, released = summary.released.len(), "Teardown complete");
        } else {
            tracing::warn!(
                stack_id,
                released = summary.released.len(),
                failed = summary.failed.len(),
                "Teardown incomplete"
            );
        }

        summary
    }

    async fn execute_action(
        &self,
        record: &ResourceRecord,
        cloud: &dyn CloudCapability,
    ) -> Result<(), (ErrorCode, String)> {
        match &record.teardown_action {
            TeardownAction::Noop => Ok(()),
            TeardownAction::Release => {
                let release = cloud.release_resource(&record.resource_id, record.resource_type);
                match tokio::time::timeout(self.action_timeout, release).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err((e.code(), e.to_string())),
                    Err(_) => Err((
                        ErrorCode::OperationTimeout,
                        format!(
                            "release did not finish within {}",
                            humantime::format_duration(self.action_timeout)
                        ),
                    )),
                }
            }
            TeardownAction::Command { program, args } => {
                let status = tokio::process::Command::new(program)
                    .args(args)
                    .kill_on_drop(true)
                    .status();
                match tokio::time::timeout(self.action_timeout, status).await {
                    Ok(Ok(status)) if status.success() => Ok(()),
                    Ok(Ok(status)) => Err((
                        ErrorCode::TeardownFailed,
                        format!("{} exited with {}", program, status),
                    )),
                    Ok(Err(e)) => Err((
                        ErrorCode::TeardownFailed,
                        format!("failed to run {}: {}", program, e),
                    )),
                    Err(_) => Err((
                        ErrorCode::OperationTimeout,
                        format!("{} did not finish in time", program),
                    )),
                }
            }
        }
    }

    fn mark_reclaimed(&self, resource_id: &str) {
        let mut inner = self.lock();
        inner.records.retain(|r| r.resource_id != resource_id);

        if let Some(ledger) = inner.ledger.as_mut() {
            if let Err(e) = ledger.mark_reclaimed(resource_id) {
                tracing::warn!(resource_id, error = %e, "Failed to mark resource reclaimed in ledger");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{ResourceState, SimulatedCloud};
    use tempfile::TempDir;

    fn registry() -> ResourceRegistry {
        ResourceRegistry::new(Arc::new(ErrorEngine::new()))
    }

    #[test]
    fn test_same_stack_reregistration_is_noop() {
        let registry = registry();
        registry
            .register("i-1", ResourceType::Compute, "ai-stack", TeardownAction::Release)
            .unwrap();
        registry
            .register("i-1", ResourceType::Compute, "ai-stack", TeardownAction::Release)
            .unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cross_stack_registration_is_rejected() {
        let registry = registry();
        registry
            .register("vol-1", ResourceType::Storage, "ai-stack", TeardownAction::Release)
            .unwrap();

        let err = registry
            .register("vol-1", ResourceType::Storage, "other", TeardownAction::Release)
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateResource { .. }));
        assert_eq!(err.code(), ErrorCode::ResourceConflict);
        assert_eq!(registry.engine().occurrences(&ErrorCode::ResourceConflict), 1);
    }

    #[test]
    fn test_list_by_stack_follows_dependency_order() {
        let registry = registry();
        let stack = "ai-stack";
        registry.register("vpc-1", ResourceType::Network, stack, TeardownAction::Release).unwrap();
        registry.register("role-1", ResourceType::Identity, stack, TeardownAction::Release).unwrap();
        registry.register("pol-1", ResourceType::IdentityPolicy, stack, TeardownAction::Release).unwrap();
        registry.register("sg-1", ResourceType::SecurityRule, stack, TeardownAction::Release).unwrap();
        registry.register("sg-2", ResourceType::SecurityRule, stack, TeardownAction::Release).unwrap();
        registry.register("vol-1", ResourceType::Storage, stack, TeardownAction::Release).unwrap();
        registry.register("i-1", ResourceType::Compute, stack, TeardownAction::Release).unwrap();
        registry.register("lb-1", ResourceType::LoadBalancer, stack, TeardownAction::Release).unwrap();
        registry.register("other-vpc", ResourceType::Network, "other", TeardownAction::Release).unwrap();

        let order: Vec<String> = registry
            .list_by_stack(stack)
            .into_iter()
            .map(|r| r.resource_id)
            .collect();
        assert_eq!(
            order,
            vec!["lb-1", "i-1", "vol-1", "sg-2", "sg-1", "pol-1", "role-1", "vpc-1"]
        );
    }

    #[tokio::test]
    async fn test_partial_teardown_is_not_complete() {
        let registry = registry();
        let cloud = SimulatedCloud::new();
        cloud.fail_release("vol-1");

        registry.register("vpc-1", ResourceType::Network, "ai-stack", TeardownAction::Release).unwrap();
        registry.register("vol-1", ResourceType::Storage, "ai-stack", TeardownAction::Release).unwrap();
        registry.register("i-1", ResourceType::Compute, "ai-stack", TeardownAction::Release).unwrap();

        let summary = registry.teardown_stack("ai-stack", &cloud).await;

        assert!(!summary.is_complete());
        assert_eq!(summary.released.len(), 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].resource_id, "vol-1");

        // Walk continued past the failure
        let released: Vec<String> = cloud.released().into_iter().map(|(id, _)| id).collect();
        assert_eq!(released, vec!["i-1", "vpc-1"]);

        // The failed entry stays registered, strategy skip
        assert_eq!(registry.list_by_stack("ai-stack").len(), 1);
        assert_eq!(
            registry.engine().strategy_for(&ErrorCode::TeardownFailed),
            Some(RecoveryStrategy::Skip)
        );
    }

    #[tokio::test]
    async fn test_teardown_runs_command_and_noop_actions() {
        let registry = registry();
        let cloud = SimulatedCloud::new();

        registry
            .register(
                "hook-ok",
                ResourceType::Stack,
                "ai-stack",
                TeardownAction::Command {
                    program: "true".into(),
                    args: vec![],
                },
            )
            .unwrap();
        registry
            .register(
                "hook-missing",
                ResourceType::Stack,
                "ai-stack",
                TeardownAction::Command {
                    program: "/nonexistent/stackctl-hook".into(),
                    args: vec!["--force".into()],
                },
            )
            .unwrap();
        registry.register("rt-1", ResourceType::Route, "ai-stack", TeardownAction::Noop).unwrap();

        let summary = registry.teardown_stack("ai-stack", &cloud).await;
        assert_eq!(summary.released.len(), 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].resource_id, "hook-missing");
        assert!(cloud.released().is_empty());
    }

    #[tokio::test]
    async fn test_release_touches_only_named_resources() {
        let registry = registry();
        let cloud = SimulatedCloud::new();
        registry.register("vpc-1", ResourceType::Network, "ai-stack", TeardownAction::Release).unwrap();
        registry.register("i-1", ResourceType::Compute, "ai-stack", TeardownAction::Release).unwrap();
        registry.register("i-2", ResourceType::Compute, "other-stack", TeardownAction::Release).unwrap();

        let ids = vec!["i-1".to_string(), "i-2".to_string()];
        let summary = registry.release("ai-stack", &ids, &cloud).await;

        assert!(summary.is_complete());
        assert_eq!(summary.released.len(), 1);
        assert_eq!(cloud.released(), vec![("i-1".to_string(), ResourceType::Compute)]);
        assert!(registry.lookup("vpc-1").is_some());
        assert!(registry.lookup("i-2").is_some());
    }

    #[tokio::test]
    async fn test_ledger_survives_reopen_and_teardown_reclaims() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("ledger.db");
        let cloud = SimulatedCloud::new();
        cloud.put_resource("i-1", ResourceState::Running, 0);

        {
            let registry = ResourceRegistry::open(&db, Arc::new(ErrorEngine::new())).unwrap();
            registry.register("i-1", ResourceType::Compute, "ai-stack", TeardownAction::Release).unwrap();
            registry.register("vpc-1", ResourceType::Network, "ai-stack", TeardownAction::Release).unwrap();
        }

        let registry = ResourceRegistry::open(&db, Arc::new(ErrorEngine::new())).unwrap();
        assert_eq!(registry.list_by_stack("ai-stack").len(), 2);

        let summary = registry.teardown_stack("ai-stack", &cloud).await;
        assert!(summary.is_complete());

        let reopened = ResourceRegistry::open(&db, Arc::new(ErrorEngine::new())).unwrap();
        assert!(reopened.is_empty());
        assert_eq!(
            reopened.ledger_stats(),
            Some(LedgerStats {
                active: 0,
                reclaimed: 2
            })
        );
    }
}
