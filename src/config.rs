/// Deployment configuration
///
/// Loaded in layers, later sources overriding earlier ones:
/// 1. Built-in defaults
/// 2. Configuration file given with `--config` (TOML, YAML or JSON)
/// 3. Environment variables prefixed `STACKCTL_`, sections split by `__`
///    (e.g. `STACKCTL_PROVISIONING__MAX_SPOT_PRICE=0.9`)
use crate::error::RetryPolicy;
use crate::health::{MonitorSettings, ServiceEndpoint};
use crate::provisioner::{DesiredShape, ProvisionerSettings};
use crate::validation::{inputs, RunOptions};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub provisioning: ProvisioningConfig,
    pub validation: ValidationConfig,
    pub health: HealthConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub primary_region: String,
    pub fallback_regions: Vec<String>,
    pub instance_classes: Vec<String>,
    pub min_vcpus: u32,
    pub min_memory_gib: u32,
    pub interruptible: bool,
    pub max_spot_price: Option<f64>,
    pub diversified: bool,
    pub concurrency_cap: usize,
    pub attempt_timeout_secs: u64,
    pub cycle_deadline_secs: u64,

    /// Release the allocations a failed or cancelled provisioning call
    /// created. Resources registered earlier are never touched.
    pub rollback_on_failure: bool,

    pub retry: RetryPolicy,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        let shape = DesiredShape::default();
        let settings = ProvisionerSettings::default();
        Self {
            primary_region: "us-east-1".to_string(),
            fallback_regions: vec!["us-west-2".to_string(), "eu-west-1".to_string()],
            instance_classes: shape.preferred_classes,
            min_vcpus: shape.min_vcpus,
            min_memory_gib: shape.min_memory_gib,
            interruptible: shape.interruptible,
            max_spot_price: shape.max_spot_price,
            diversified: shape.diversified,
            concurrency_cap: settings.concurrency_cap,
            attempt_timeout_secs: settings.attempt_timeout.as_secs(),
            cycle_deadline_secs: settings.cycle_deadline.as_secs(),
            rollback_on_failure: true,
            retry: settings.retry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub cache: bool,
    pub cache_ttl_secs: u64,
    pub parallel: bool,
    pub retry: bool,
    pub retry_policy: RetryPolicy,

    /// Binaries the `dependencies` check looks for on PATH
    pub required_binaries: Vec<String>,

    /// Variables the `environment` check requires
    pub required_env: Vec<String>,

    /// Root the `modules` check resolves relative files against
    pub module_root: PathBuf,
    pub required_files: Vec<PathBuf>,

    /// Endpoints the `network` check probes
    pub network_endpoints: Vec<String>,
    pub network_timeout_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        let options = RunOptions::default();
        Self {
            cache: options.cache,
            cache_ttl_secs: options.ttl.as_secs(),
            parallel: options.parallel,
            retry: options.retry,
            retry_policy: options.retry_policy,
            required_binaries: vec!["docker".to_string()],
            required_env: vec!["AWS_REGION".to_string()],
            module_root: PathBuf::from("."),
            required_files: Vec::new(),
            network_endpoints: Vec::new(),
            network_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub tick_deadline_secs: u64,
    pub notify_cooldown_secs: u64,

    /// Consecutive unhealthy ticks before `monitor` tears the stack down;
    /// 0 disables automatic rollback
    pub unhealthy_threshold: u32,

    pub collect_metrics: bool,
    pub services: Vec<ServiceEndpoint>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        let settings = MonitorSettings::default();
        Self {
            interval_secs: settings.interval.as_secs(),
            probe_timeout_secs: settings.probe_timeout.as_secs(),
            tick_deadline_secs: settings.tick_deadline.as_secs(),
            notify_cooldown_secs: 300,
            unhealthy_threshold: 3,
            collect_metrics: settings.collect_metrics,
            services: ServiceEndpoint::defaults_for("localhost"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Overrides the platform state directory
    pub state_dir: Option<PathBuf>,
}

impl DeployConfig {
    /// Load defaults, then `path` if given, then `STACKCTL_*` environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("STACKCTL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let loaded = builder
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize::<DeployConfig>()
            .context("Failed to parse configuration")?;

        Ok(loaded)
    }

    /// Every rule violation, empty when the configuration is usable
    pub fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let p = &self.provisioning;

        for region in std::iter::once(&p.primary_region).chain(&p.fallback_regions) {
            if let Err(e) = inputs::validate_region(region) {
                violations.push(format!("provisioning: {}", e));
            }
        }
        if p.instance_classes.is_empty() {
            violations.push("provisioning.instance_classes: at least one class required".into());
        }
        for class in &p.instance_classes {
            if let Err(e) = inputs::validate_instance_type(class) {
                violations.push(format!("provisioning.instance_classes: {}", e));
            }
        }
        if let Some(price) = p.max_spot_price {
            if let Err(e) = inputs::check_spot_price(price) {
                violations.push(format!("provisioning.max_spot_price: {}", e));
            }
        }
        if p.concurrency_cap == 0 {
            violations.push("provisioning.concurrency_cap: must be at least 1".into());
        }
        if p.attempt_timeout_secs == 0 || p.cycle_deadline_secs == 0 {
            violations.push("provisioning: timeouts must be positive".into());
        }
        if p.attempt_timeout_secs > p.cycle_deadline_secs {
            violations.push("provisioning.attempt_timeout_secs: exceeds cycle_deadline_secs".into());
        }

        if self.validation.cache_ttl_secs == 0 {
            violations.push("validation.cache_ttl_secs: must be positive".into());
        }

        let h = &self.health;
        if h.interval_secs == 0 {
            violations.push("health.interval_secs: must be positive".into());
        }
        if h.probe_timeout_secs == 0 || h.probe_timeout_secs > h.tick_deadline_secs {
            violations.push("health.probe_timeout_secs: must be positive and within tick_deadline_secs".into());
        }
        for service in &h.services {
            if !service.url.starts_with("http://") && !service.url.starts_with("https://") {
                violations.push(format!("health.services.{}: not an http(s) url", service.name));
            }
        }

        violations
    }

    pub fn shape(&self) -> DesiredShape {
        let p = &self.provisioning;
        DesiredShape {
            preferred_classes: p.instance_classes.clone(),
            min_vcpus: p.min_vcpus,
            min_memory_gib: p.min_memory_gib,
            interruptible: p.interruptible,
            max_spot_price: p.max_spot_price,
            diversified: p.diversified,
        }
    }

    pub fn provisioner_settings(&self) -> ProvisionerSettings {
        let p = &self.provisioning;
        ProvisionerSettings {
            concurrency_cap: p.concurrency_cap.max(1),
            attempt_timeout: Duration::from_secs(p.attempt_timeout_secs),
            cycle_deadline: Duration::from_secs(p.cycle_deadline_secs),
            retry: p.retry.clone(),
            unwind_on_failure: p.rollback_on_failure,
        }
    }

    pub fn run_options(&self, context: Option<&str>) -> RunOptions {
        let v = &self.validation;
        RunOptions {
            parallel: v.parallel,
            cache: v.cache,
            retry: v.retry,
            ttl: Duration::from_secs(v.cache_ttl_secs),
            context: context.map(str::to_string),
            retry_policy: v.retry_policy.clone(),
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        let h = &self.health;
        MonitorSettings {
            probe_timeout: Duration::from_secs(h.probe_timeout_secs),
            tick_deadline: Duration::from_secs(h.tick_deadline_secs),
            interval: Duration::from_secs(h.interval_secs),
            collect_metrics: h.collect_metrics,
        }
    }

    /// Directory for the journal, ledger, reports and logs
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.paths.state_dir {
            return dir.clone();
        }
        ProjectDirs::from("dev", "gpu-stack", "stackctl")
            .map(|dirs| dirs.data_local_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".stackctl"))
    }

    pub fn journal_path(&self) -> PathBuf {
        self.state_dir().join("error-journal.ndjson")
    }

    pub fn report_path(&self) -> PathBuf {
        self.state_dir().join("errors-report.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir().join("ledger.db")
    }

    pub fn health_dir(&self) -> PathBuf {
        self.state_dir().join("health")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }
}
