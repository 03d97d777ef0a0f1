// Deployment facade
//
// Wires the error engine, resource registry, provisioner, validator and health
// monitor around one injected cloud capability, and exposes the four
// operations the surrounding tooling drives: provision, teardown, validation
// and health checks. Whole-stack rollback on sustained unhealthiness lives
// here; a failed provisioning call only unwinds its own allocations.

use crate::cloud::CloudCapability;
use crate::config::DeployConfig;
use crate::error::{ErrorEngine, ErrorReport};
use crate::health::{
    HealthMonitor, HealthProbes, HealthSnapshot, HealthStatus, LogNotifier, NotificationGate,
    Notifier, SnapshotReporter,
};
use crate::provisioner::{AllocationResult, DesiredShape, FallbackMatrix, Provisioner};
use crate::registry::{ResourceRegistry, TeardownSummary};
use crate::validation::{
    inputs, DependencyCheck, EnvironmentCheck, ModuleCheck, NetworkCheck, RunOptions, RunOutcome,
    ValidationError, ValidationTarget, Validator,
};
use crate::{DeployError, DeployResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// How a `monitor` loop ended
#[derive(Debug)]
pub enum MonitorOutcome {
    /// Shutdown was requested
    Stopped { ticks: u64, last: Option<HealthStatus> },

    /// The stack stayed unhealthy for the configured number of ticks and
    /// was torn down
    RolledBack {
        ticks: u64,
        summary: TeardownSummary,
    },
}

pub struct Deployment {
    config: DeployConfig,
    cloud: Arc<dyn CloudCapability>,
    engine: Arc<ErrorEngine>,
    registry: Arc<ResourceRegistry>,
    provisioner: Provisioner,
    validator: Validator,
    monitor: HealthMonitor,
    reporter: Option<SnapshotReporter>,
    persistent: bool,
}

impl Deployment {
    /// Fully in-memory deployment: nothing is written to disk
    pub fn new(config: DeployConfig, cloud: Arc<dyn CloudCapability>) -> Self {
        let engine = Arc::new(ErrorEngine::new());
        let registry = Arc::new(ResourceRegistry::new(Arc::clone(&engine)));
        Self::assemble(config, cloud, engine, registry, None, false)
    }

    /// Deployment backed by the state directory: error journal, SQLite
    /// resource ledger and health snapshot reports
    pub fn open(config: DeployConfig, cloud: Arc<dyn CloudCapability>) -> DeployResult<Self> {
        let violations = config.validate();
        if !violations.is_empty() {
            return Err(DeployError::Config(violations.join("; ")));
        }

        let state_dir = config.state_dir();
        std::fs::create_dir_all(&state_dir)?;

        let engine = Arc::new(ErrorEngine::with_journal(config.journal_path()));
        let registry = Arc::new(ResourceRegistry::open(
            &config.ledger_path(),
            Arc::clone(&engine),
        )?);
        let reporter = SnapshotReporter::new(config.health_dir());

        tracing::info!(state_dir = %state_dir.display(), "Opened deployment state");

        Ok(Self::assemble(
            config,
            cloud,
            engine,
            registry,
            Some(reporter),
            true,
        ))
    }

    fn assemble(
        config: DeployConfig,
        cloud: Arc<dyn CloudCapability>,
        engine: Arc<ErrorEngine>,
        registry: Arc<ResourceRegistry>,
        reporter: Option<SnapshotReporter>,
        persistent: bool,
    ) -> Self {
        let provisioner = Provisioner::new(
            Arc::clone(&cloud),
            Arc::clone(&registry),
            Arc::clone(&engine),
            config.provisioner_settings(),
        );
        let validator = Self::default_validator(&config, &cloud, &engine);
        let monitor = Self::build_monitor(
            &config,
            &cloud,
            &registry,
            &engine,
            Arc::new(LogNotifier),
            reporter.clone(),
        );

        Self {
            config,
            cloud,
            engine,
            registry,
            provisioner,
            validator,
            monitor,
            reporter,
            persistent,
        }
    }

    /// The four built-in checks, parameterised from configuration
    fn default_validator(
        config: &DeployConfig,
        cloud: &Arc<dyn CloudCapability>,
        engine: &Arc<ErrorEngine>,
    ) -> Validator {
        let v = &config.validation;

        // Without explicit endpoints the network check probes the services
        let endpoints = if v.network_endpoints.is_empty() {
            config.health.services.iter().map(|s| s.url.clone()).collect()
        } else {
            v.network_endpoints.clone()
        };

        Validator::new(Arc::clone(engine))
            .with_check(Arc::new(DependencyCheck::new(v.required_binaries.clone())))
            .with_check(Arc::new(EnvironmentCheck::new(v.required_env.clone())))
            .with_check(Arc::new(ModuleCheck::new(
                v.module_root.clone(),
                v.required_files.clone(),
            )))
            .with_check(Arc::new(NetworkCheck::new(
                Arc::clone(cloud),
                endpoints,
                Duration::from_secs(v.network_timeout_secs),
            )))
    }

    fn build_monitor(
        config: &DeployConfig,
        cloud: &Arc<dyn CloudCapability>,
        registry: &Arc<ResourceRegistry>,
        engine: &Arc<ErrorEngine>,
        notifier: Arc<dyn Notifier>,
        reporter: Option<SnapshotReporter>,
    ) -> HealthMonitor {
        let settings = config.monitor_settings();
        let probes = HealthProbes::new(
            Arc::clone(cloud),
            Arc::clone(registry),
            config.health.services.clone(),
            settings.probe_timeout,
        );
        let gate = NotificationGate::new(Duration::from_secs(config.health.notify_cooldown_secs));

        let monitor =
            HealthMonitor::new(probes, Arc::clone(engine), notifier, gate, settings);
        match reporter {
            Some(reporter) => monitor.with_reporter(reporter),
            None => monitor,
        }
    }

    /// Replace the alert channel
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.monitor = Self::build_monitor(
            &self.config,
            &self.cloud,
            &self.registry,
            &self.engine,
            notifier,
            self.reporter.clone(),
        );
        self
    }

    /// Replace the validator (custom checks or clock)
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ErrorEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn reporter(&self) -> Option<&SnapshotReporter> {
        self.reporter.as_ref()
    }

    /// Provision the configured shape across the configured regions
    pub async fn provision(&self, stack_id: &str) -> DeployResult<AllocationResult> {
        self.provision_cancellable(stack_id, std::future::pending()).await
    }

    /// Provision the configured shape, stopping early when `cancel`
    /// resolves. Allocations made before the cancellation are released.
    pub async fn provision_cancellable<C>(&self, stack_id: &str, cancel: C) -> DeployResult<AllocationResult>
    where
        C: Future<Output = ()>,
    {
        let shape = self.config.shape();
        let matrix = FallbackMatrix::build(
            &shape,
            &self.config.provisioning.primary_region,
            &self.config.provisioning.fallback_regions,
        );
        self.provision_inner(stack_id, &shape, &matrix, cancel).await
    }

    /// Provision against an explicit fallback matrix
    pub async fn provision_with(
        &self,
        stack_id: &str,
        shape: &DesiredShape,
        matrix: &FallbackMatrix,
    ) -> DeployResult<AllocationResult> {
        self.provision_inner(stack_id, shape, matrix, std::future::pending())
            .await
    }

    async fn provision_inner<C>(
        &self,
        stack_id: &str,
        shape: &DesiredShape,
        matrix: &FallbackMatrix,
        cancel: C,
    ) -> DeployResult<AllocationResult>
    where
        C: Future<Output = ()>,
    {
        inputs::validate_stack_name(stack_id).map_err(ValidationError::from)?;

        tracing::info!(
            stack_id,
            candidates = matrix.len(),
            interruptible = shape.interruptible,
            "Provisioning stack"
        );

        let deadline = tokio::time::Instant::now() + self.provisioner.settings().cycle_deadline;
        match self
            .provisioner
            .provision_cancellable(stack_id, shape, matrix, deadline, cancel)
            .await
        {
            Ok(result) => {
                tracing::info!(
                    stack_id,
                    resource_id = %result.resource_id,
                    candidate = %result.candidate,
                    rejections = result.attempts.len(),
                    "Stack provisioned"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::error!(stack_id, code = %e.code(), error = %e, "Provisioning failed");
                Err(e.into())
            }
        }
    }

    /// Release every resource registered to the stack
    pub async fn teardown(&self, stack_id: &str) -> TeardownSummary {
        self.registry
            .teardown_stack(stack_id, self.cloud.as_ref())
            .await
    }

    async fn rollback(&self, stack_id: &str, reason: &str) -> TeardownSummary {
        tracing::warn!(stack_id, reason, "Rolling back stack");
        self.teardown(stack_id).await
    }

    /// Run checks with explicit options
    pub async fn run_validation(
        &self,
        target: ValidationTarget,
        options: &RunOptions,
    ) -> RunOutcome {
        self.validator.run(target, options).await
    }

    /// Run checks with the configured options
    pub async fn validate(&self, target: ValidationTarget, context: Option<&str>) -> RunOutcome {
        let options = self.config.run_options(context);
        self.validator.run(target, &options).await
    }

    pub async fn health_check(&self, stack_id: &str) -> HealthSnapshot {
        self.monitor.check(stack_id).await
    }

    /// Check health every tick until `shutdown` resolves. When the
    /// configured threshold of consecutive unhealthy ticks is reached, the
    /// stack is torn down and the loop ends.
    pub async fn monitor<S>(&self, stack_id: &str, shutdown: S) -> MonitorOutcome
    where
        S: Future<Output = ()>,
    {
        let threshold = self.config.health.unhealthy_threshold;
        let mut interval = tokio::time::interval(self.monitor.settings().interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut ticks = 0u64;
        let mut consecutive_unhealthy = 0u32;
        let mut last = None;

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(stack_id, ticks, "Health monitor stopped");
                    return MonitorOutcome::Stopped { ticks, last };
                }
                _ = interval.tick() => {}
            }

            let snapshot = self.monitor.check(stack_id).await;
            ticks += 1;
            last = Some(snapshot.overall);

            if snapshot.overall == HealthStatus::Unhealthy {
                consecutive_unhealthy += 1;
            } else {
                consecutive_unhealthy = 0;
            }

            if threshold > 0 && consecutive_unhealthy >= threshold {
                let summary = self.rollback(stack_id, "sustained unhealthy status").await;
                return MonitorOutcome::RolledBack { ticks, summary };
            }
        }
    }

    /// Persist the error report at process end (no-op for in-memory deployments)
    pub fn finish(&self) -> anyhow::Result<Option<ErrorReport>> {
        if !self.persistent {
            return Ok(None);
        }
        let report = self.engine.flush_report(&self.config.report_path())?;
        Ok(Some(report))
    }
}
