/// Health monitor
///
/// Five independent probes (control-plane stack, compute instances,
/// application services, network, storage) run concurrently on every tick.
/// Each probe is bounded by its own timeout; a probe that does not answer in
/// time marks only its own domain `unknown`. The domain statuses aggregate
/// into one overall status:
///
/// - any domain unhealthy or not_found → unhealthy
/// - else any domain degraded, updating or unknown → degraded
/// - else healthy
///
/// Every snapshot is persisted; non-healthy snapshots notify, subject to the
/// cool-down in `notify::NotificationGate`.
pub mod notify;
pub mod probes;
pub mod report;

pub use notify::{HealthAlert, LogNotifier, NotificationGate, Notifier};
pub use probes::{HealthProbes, ServiceEndpoint, LIVENESS_URL};
pub use report::SnapshotReporter;

use crate::error::{ErrorCode, ErrorContext, ErrorEngine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Updating,
    Unhealthy,
    NotFound,
    Unknown,
}

impl HealthStatus {
    pub fn is_failing(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy | HealthStatus::NotFound)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            HealthStatus::Degraded | HealthStatus::Updating | HealthStatus::Unknown
        )
    }

    /// Collapse many statuses into one
    pub fn aggregate<I: IntoIterator<Item = HealthStatus>>(statuses: I) -> HealthStatus {
        let mut overall = HealthStatus::Healthy;
        for status in statuses {
            if status.is_failing() {
                return HealthStatus::Unhealthy;
            }
            if status.is_degraded() {
                overall = HealthStatus::Degraded;
            }
        }
        overall
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Updating => "updating",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::NotFound => "not_found",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthDomain {
    Stack,
    Instances,
    Services,
    Network,
    Storage,
}

impl HealthDomain {
    pub const ALL: [HealthDomain; 5] = [
        HealthDomain::Stack,
        HealthDomain::Instances,
        HealthDomain::Services,
        HealthDomain::Network,
        HealthDomain::Storage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthDomain::Stack => "stack",
            HealthDomain::Instances => "instances",
            HealthDomain::Services => "services",
            HealthDomain::Network => "network",
            HealthDomain::Storage => "storage",
        }
    }

    /// Code classified when this domain is failing
    fn failure_code(&self) -> ErrorCode {
        match self {
            HealthDomain::Services => ErrorCode::EndpointUnreachable,
            HealthDomain::Network => ErrorCode::NetworkNotFound,
            HealthDomain::Stack | HealthDomain::Instances | HealthDomain::Storage => {
                ErrorCode::DependencyNotReady
            }
        }
    }
}

impl fmt::Display for HealthDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainReport {
    pub status: HealthStatus,
    pub detail: String,
}

impl DomainReport {
    pub fn new(status: HealthStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,

    /// Mean latency of the service probes that answered
    pub latency_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub stack_id: String,
    pub timestamp: DateTime<Utc>,
    pub domains: BTreeMap<HealthDomain, DomainReport>,
    pub services: BTreeMap<String, HealthStatus>,
    pub metrics: PerformanceMetrics,
    pub overall: HealthStatus,
}

impl HealthSnapshot {
    /// Build a snapshot; `overall` is always derived from the domains
    pub fn new(
        stack_id: impl Into<String>,
        domains: BTreeMap<HealthDomain, DomainReport>,
        services: BTreeMap<String, HealthStatus>,
        metrics: PerformanceMetrics,
    ) -> Self {
        let overall = HealthStatus::aggregate(domains.values().map(|d| d.status));
        Self {
            stack_id: stack_id.into(),
            timestamp: Utc::now(),
            domains,
            services,
            metrics,
            overall,
        }
    }

    /// Status of one domain; a missing domain counts as unknown
    pub fn domain(&self, domain: HealthDomain) -> HealthStatus {
        self.domains
            .get(&domain)
            .map(|d| d.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    pub fn is_healthy(&self) -> bool {
        self.overall == HealthStatus::Healthy
    }

    /// Domains that are not healthy
    pub fn problems(&self) -> Vec<(HealthDomain, &DomainReport)> {
        self.domains
            .iter()
            .filter(|(_, report)| report.status != HealthStatus::Healthy)
            .map(|(domain, report)| (*domain, report))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Bound on each domain probe
    pub probe_timeout: Duration,

    /// Bound on a whole tick
    pub tick_deadline: Duration,

    /// Cadence of the monitoring loop
    pub interval: Duration,

    /// Collect host metrics with sysinfo
    pub collect_metrics: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(10),
            tick_deadline: Duration::from_secs(30),
            interval: Duration::from_secs(60),
            collect_metrics: true,
        }
    }
}

pub struct HealthMonitor {
    probes: HealthProbes,
    engine: Arc<ErrorEngine>,
    reporter: Option<SnapshotReporter>,
    notifier: Arc<dyn Notifier>,
    gate: NotificationGate,
    settings: MonitorSettings,
    system: Mutex<System>,
}

impl HealthMonitor {
    pub fn new(
        probes: HealthProbes,
        engine: Arc<ErrorEngine>,
        notifier: Arc<dyn Notifier>,
        gate: NotificationGate,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            probes,
            engine,
            reporter: None,
            notifier,
            gate,
            settings,
            system: Mutex::new(System::new()),
        }
    }

    pub fn with_reporter(mut self, reporter: SnapshotReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// One monitoring tick within the configured tick deadline
    pub async fn check(&self, stack_id: &str) -> HealthSnapshot {
        let deadline = Instant::now() + self.settings.tick_deadline;
        self.check_until(stack_id, deadline).await
    }

    /// One monitoring tick; probes still running at `deadline` are abandoned
    /// and their domains reported as unknown
    pub async fn check_until(&self, stack_id: &str, deadline: Instant) -> HealthSnapshot {
        let probe_deadline = deadline.min(Instant::now() + self.settings.probe_timeout);

        let (stack, instances, services, network, storage) = tokio::join!(
            bounded(probe_deadline, self.probes.stack(stack_id)),
            bounded(probe_deadline, self.probes.instances(stack_id)),
            bounded(probe_deadline, self.probes.services()),
            bounded(probe_deadline, self.probes.network(stack_id)),
            bounded(probe_deadline, self.probes.storage(stack_id)),
        );

        let (services_report, service_map, latency_ms) = match services {
            Some(outcome) => (outcome.report, outcome.services, outcome.mean_latency_ms),
            None => (timed_out(), BTreeMap::new(), None),
        };

        let mut domains = BTreeMap::new();
        domains.insert(HealthDomain::Stack, stack.unwrap_or_else(timed_out));
        domains.insert(HealthDomain::Instances, instances.unwrap_or_else(timed_out));
        domains.insert(HealthDomain::Services, services_report);
        domains.insert(HealthDomain::Network, network.unwrap_or_else(timed_out));
        domains.insert(HealthDomain::Storage, storage.unwrap_or_else(timed_out));

        let mut metrics = if self.settings.collect_metrics {
            self.host_metrics()
        } else {
            PerformanceMetrics::default()
        };
        metrics.latency_ms = latency_ms;

        let snapshot = HealthSnapshot::new(stack_id, domains, service_map, metrics);

        self.classify_problems(&snapshot);
        self.publish(&snapshot).await;

        snapshot
    }

    fn classify_problems(&self, snapshot: &HealthSnapshot) {
        for (domain, report) in snapshot.problems() {
            let code = match report.status {
                HealthStatus::Unknown => ErrorCode::OperationTimeout,
                status if status.is_failing() => domain.failure_code(),
                _ => continue,
            };
            let ctx = ErrorContext::new("health_probe")
                .with_stack(snapshot.stack_id.as_str())
                .with_metadata("domain", domain.as_str())
                .with_metadata("status", report.status.as_str());
            self.engine.record(code, &ctx);
        }
    }

    /// Persist always; notify when not healthy and the gate allows
    async fn publish(&self, snapshot: &HealthSnapshot) {
        if let Some(reporter) = &self.reporter {
            if let Err(e) = reporter.write(snapshot) {
                tracing::warn!(stack_id = %snapshot.stack_id, error = %e, "Failed to persist health snapshot");
            }
        }

        match snapshot.overall {
            HealthStatus::Healthy => {
                tracing::info!(stack_id = %snapshot.stack_id, "Stack healthy");
            }
            overall => {
                tracing::warn!(
                    stack_id = %snapshot.stack_id,
                    overall = %overall,
                    problems = snapshot.problems().len(),
                    "Stack not healthy"
                );
            }
        }

        if let Some(previous) = self.gate.admit(&snapshot.stack_id, snapshot.overall, snapshot.timestamp) {
            let alert = HealthAlert::from_snapshot(snapshot, previous);
            if let Err(e) = self.notifier.notify(&alert).await {
                tracing::error!(stack_id = %snapshot.stack_id, error = %e, "Failed to send health notification");
            }
        }
    }

    fn host_metrics(&self) -> PerformanceMetrics {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu();
        system.refresh_memory();

        let memory_percent = if system.total_memory() > 0 {
            (system.used_memory() as f64 / system.total_memory() as f64 * 100.0) as f32
        } else {
            0.0
        };

        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks.list().iter().fold((0u64, 0u64), |(t, a), disk| {
            (t + disk.total_space(), a + disk.available_space())
        });
        let disk_percent = if total > 0 {
            (total.saturating_sub(available) as f64 / total as f64 * 100.0) as f32
        } else {
            0.0
        };

        PerformanceMetrics {
            cpu_percent: system.global_cpu_info().cpu_usage(),
            memory_percent,
            disk_percent,
            latency_ms: None,
        }
    }
}

async fn bounded<T>(deadline: Instant, probe: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout_at(deadline, probe).await.ok()
}

fn timed_out() -> DomainReport {
    DomainReport::new(HealthStatus::Unknown, "probe timed out")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domains(statuses: [HealthStatus; 5]) -> BTreeMap<HealthDomain, DomainReport> {
        HealthDomain::ALL
            .iter()
            .zip(statuses)
            .map(|(domain, status)| (*domain, DomainReport::new(status, "")))
            .collect()
    }

    #[test]
    fn test_aggregation_rules() {
        use HealthStatus::*;

        assert_eq!(HealthStatus::aggregate([Healthy; 5]), Healthy);
        assert_eq!(HealthStatus::aggregate([Healthy, Updating, Healthy]), Degraded);
        assert_eq!(HealthStatus::aggregate([Healthy, Unknown]), Degraded);
        assert_eq!(HealthStatus::aggregate([Degraded, NotFound]), Unhealthy);
        assert_eq!(HealthStatus::aggregate([Unhealthy, Degraded]), Unhealthy);
        assert_eq!(HealthStatus::aggregate(std::iter::empty()), Healthy);
    }

    #[test]
    fn test_snapshot_overall_is_derived() {
        use HealthStatus::*;

        let snapshot = HealthSnapshot::new(
            "ai-stack",
            domains([Healthy, Healthy, Healthy, NotFound, Healthy]),
            BTreeMap::new(),
            PerformanceMetrics::default(),
        );
        assert_eq!(snapshot.overall, Unhealthy);
        assert_eq!(snapshot.problems().len(), 1);
        assert_eq!(snapshot.domain(HealthDomain::Network), NotFound);
    }

    #[test]
    fn test_snapshot_serializes_snake_case() {
        use HealthStatus::*;

        let snapshot = HealthSnapshot::new(
            "ai-stack",
            domains([Healthy, Healthy, Healthy, Healthy, NotFound]),
            BTreeMap::from([("ollama".to_string(), Healthy)]),
            PerformanceMetrics::default(),
        );
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["overall"], "unhealthy");
        assert_eq!(value["domains"]["storage"]["status"], "not_found");
        assert_eq!(value["services"]["ollama"], "healthy");
    }
}
