use gpu_stack_deploy::cloud::SimulatedCloud;
use gpu_stack_deploy::error::{ErrorEngine, RetryPolicy};
use gpu_stack_deploy::provisioner::{Provisioner, ProvisionerSettings};
use gpu_stack_deploy::registry::ResourceRegistry;
use gpu_stack_deploy::DeployConfig;
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub cloud: Arc<SimulatedCloud>,
    pub engine: Arc<ErrorEngine>,
    pub registry: Arc<ResourceRegistry>,
    pub provisioner: Provisioner,
}

/// Settings that keep tests fast: no backoff sleeps, short deadlines
pub fn fast_settings() -> ProvisionerSettings {
    ProvisionerSettings {
        concurrency_cap: 4,
        attempt_timeout: Duration::from_millis(500),
        cycle_deadline: Duration::from_secs(5),
        retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5))
            .with_jitter(0.0),
        unwind_on_failure: true,
    }
}

pub fn harness() -> Harness {
    harness_with(Arc::new(ResourceRegistry::new(Arc::new(ErrorEngine::new()))))
}

/// Harness around an existing registry (e.g. one opened on a ledger file)
pub fn harness_with(registry: Arc<ResourceRegistry>) -> Harness {
    let cloud = Arc::new(SimulatedCloud::new());
    let engine = Arc::clone(registry.engine());
    let provisioner = Provisioner::new(
        cloud.clone(),
        Arc::clone(&registry),
        Arc::clone(&engine),
        fast_settings(),
    );
    Harness {
        cloud,
        engine,
        registry,
        provisioner,
    }
}

/// Configuration with short health timings and no host metrics
pub fn quick_config() -> DeployConfig {
    let mut config = DeployConfig::default();
    config.provisioning.retry = RetryPolicy::none();
    config.health.probe_timeout_secs = 1;
    config.health.tick_deadline_secs = 2;
    config.health.interval_secs = 1;
    config.health.collect_metrics = false;
    config
}
