/// Per-domain health probes
///
/// Each probe answers for one domain only and never fails: provider errors
/// become an unhealthy or unknown report with the reason in `detail`.
use super::{DomainReport, HealthStatus};
use crate::cloud::{CloudCapability, ResourceDescription, ResourceState};
use crate::registry::{ResourceRecord, ResourceRegistry};
use crate::ResourceType;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Compute record metadata naming the instance's liveness endpoint
pub const LIVENESS_URL: &str = "liveness_url";

/// Application service exposed by the stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    pub url: String,
}

impl ServiceEndpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }

    /// The four services of the AI stack on one host
    pub fn defaults_for(host: &str) -> Vec<ServiceEndpoint> {
        vec![
            ServiceEndpoint::new("n8n", format!("http://{}:5678/healthz", host)),
            ServiceEndpoint::new("qdrant", format!("http://{}:6333/healthz", host)),
            ServiceEndpoint::new("ollama", format!("http://{}:11434/api/tags", host)),
            ServiceEndpoint::new("crawl4ai", format!("http://{}:11235/health", host)),
        ]
    }
}

pub(crate) struct ServicesOutcome {
    pub report: DomainReport,
    pub services: BTreeMap<String, HealthStatus>,
    pub mean_latency_ms: Option<f64>,
}

pub struct HealthProbes {
    cloud: Arc<dyn CloudCapability>,
    registry: Arc<ResourceRegistry>,
    endpoints: Vec<ServiceEndpoint>,
    service_timeout: Duration,
}

impl HealthProbes {
    pub fn new(
        cloud: Arc<dyn CloudCapability>,
        registry: Arc<ResourceRegistry>,
        endpoints: Vec<ServiceEndpoint>,
        service_timeout: Duration,
    ) -> Self {
        Self {
            cloud,
            registry,
            endpoints,
            service_timeout,
        }
    }

    pub fn endpoints(&self) -> &[ServiceEndpoint] {
        &self.endpoints
    }

    /// Control-plane stack record
    pub(crate) async fn stack(&self, stack_id: &str) -> DomainReport {
        let records = self.registry.find(stack_id, ResourceType::Stack);
        let Some(record) = records.first() else {
            return DomainReport::new(HealthStatus::NotFound, "no stack record registered");
        };

        match self.cloud.describe_resource(&record.resource_id).await {
            Ok(desc) => {
                let status = match &desc.state {
                    ResourceState::Complete => HealthStatus::Healthy,
                    ResourceState::Updating | ResourceState::Pending => HealthStatus::Updating,
                    ResourceState::NotFound | ResourceState::Terminated => HealthStatus::NotFound,
                    _ => HealthStatus::Unhealthy,
                };
                DomainReport::new(status, format!("{} {}", record.resource_id, desc.state))
            }
            Err(e) => DomainReport::new(HealthStatus::Unknown, e.to_string()),
        }
    }

    /// Every registered compute instance must be running and, when it
    /// carries a `liveness_url`, answer it
    pub(crate) async fn instances(&self, stack_id: &str) -> DomainReport {
        let records = self.registry.find(stack_id, ResourceType::Compute);
        if records.is_empty() {
            return DomainReport::new(HealthStatus::NotFound, "no compute instances registered");
        }

        let described = self.describe_all(&records).await;
        let total = described.len();
        let mut running = Vec::new();
        let mut pending = 0;
        let mut problems = Vec::new();

        for (record, outcome) in &described {
            match outcome {
                Ok(desc) if desc.state == ResourceState::Running => running.push(*record),
                Ok(desc) if desc.state == ResourceState::Pending => pending += 1,
                Ok(desc) => problems.push(format!("{} {}", record.resource_id, desc.state)),
                Err(reason) => problems.push(format!("{} ({})", record.resource_id, reason)),
            }
        }

        let liveness = running.iter().filter_map(|record| {
            record
                .meta(LIVENESS_URL)
                .map(|url| async move { (*record, self.probe(url).await) })
        });
        for (record, outcome) in join_all(liveness).await {
            if let Err(reason) = outcome {
                problems.push(format!("{} not live ({})", record.resource_id, reason));
            }
        }

        let status = if !problems.is_empty() {
            HealthStatus::Unhealthy
        } else if pending > 0 {
            HealthStatus::Updating
        } else {
            HealthStatus::Healthy
        };

        let mut detail = format!("{}/{} running", running.len(), total);
        if !problems.is_empty() {
            detail.push_str(&format!("; {}", problems.join(", ")));
        }
        DomainReport::new(status, detail)
    }

    /// One endpoint probe bounded by the service timeout
    async fn probe(&self, url: &str) -> Result<Duration, String> {
        let probe = self.cloud.probe_service_endpoint(url, self.service_timeout);
        match tokio::time::timeout(self.service_timeout, probe).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err("timed out".to_string()),
        }
    }

    /// Application services answer their health paths
    pub(crate) async fn services(&self) -> ServicesOutcome {
        if self.endpoints.is_empty() {
            return ServicesOutcome {
                report: DomainReport::new(HealthStatus::Healthy, "no services configured"),
                services: BTreeMap::new(),
                mean_latency_ms: None,
            };
        }

        let probes = self
            .endpoints
            .iter()
            .map(|endpoint| async move { (endpoint, self.probe(&endpoint.url).await) });

        let mut services = BTreeMap::new();
        let mut latencies = Vec::new();
        let mut down = Vec::new();

        for (endpoint, outcome) in join_all(probes).await {
            match outcome {
                Ok(latency) => {
                    latencies.push(latency.as_secs_f64() * 1000.0);
                    services.insert(endpoint.name.clone(), HealthStatus::Healthy);
                }
                Err(reason) => {
                    tracing::debug!(service = %endpoint.name, url = %endpoint.url, %reason, "Service probe failed");
                    down.push(format!("{} ({})", endpoint.name, reason));
                    services.insert(endpoint.name.clone(), HealthStatus::Unhealthy);
                }
            }
        }

        let status = HealthStatus::aggregate(services.values().copied());
        let detail = if down.is_empty() {
            format!("{} services up", services.len())
        } else {
            format!("down: {}", down.join(", "))
        };

        let mean_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };

        ServicesOutcome {
            report: DomainReport::new(status, detail),
            services,
            mean_latency_ms,
        }
    }

    /// Network, security rules and routes exist and are settled
    pub(crate) async fn network(&self, stack_id: &str) -> DomainReport {
        let networks = self.registry.find(stack_id, ResourceType::Network);
        if networks.is_empty() {
            return DomainReport::new(HealthStatus::NotFound, "no network registered");
        }

        let mut records = networks;
        records.extend(self.registry.find(stack_id, ResourceType::SecurityRule));
        records.extend(self.registry.find(stack_id, ResourceType::Route));

        let mut missing = Vec::new();
        let mut unsettled = Vec::new();
        for (record, outcome) in self.describe_all(&records).await {
            match outcome {
                Ok(desc) if desc.state.is_gone() => {
                    missing.push(format!("{} {}", record.resource_type, record.resource_id))
                }
                Ok(desc) if !desc.state.is_settled() => unsettled.push(format!(
                    "{} {} {}",
                    record.resource_type, record.resource_id, desc.state
                )),
                Ok(_) => {}
                Err(reason) => unsettled.push(format!("{} ({})", record.resource_id, reason)),
            }
        }

        if !missing.is_empty() {
            DomainReport::new(HealthStatus::NotFound, format!("missing: {}", missing.join(", ")))
        } else if !unsettled.is_empty() {
            DomainReport::new(HealthStatus::Degraded, unsettled.join(", "))
        } else {
            DomainReport::new(HealthStatus::Healthy, format!("{} resources settled", records.len()))
        }
    }

    /// Persistent storage is available or attached
    pub(crate) async fn storage(&self, stack_id: &str) -> DomainReport {
        let records = self.registry.find(stack_id, ResourceType::Storage);
        if records.is_empty() {
            return DomainReport::new(HealthStatus::Healthy, "no persistent storage registered");
        }

        let mut attachments = 0;
        let mut problems = Vec::new();
        for (record, outcome) in self.describe_all(&records).await {
            match outcome {
                Ok(desc)
                    if matches!(desc.state, ResourceState::Available | ResourceState::Attached) =>
                {
                    attachments += desc.attachments;
                }
                Ok(desc) => problems.push(format!("{} {}", record.resource_id, desc.state)),
                Err(reason) => problems.push(format!("{} ({})", record.resource_id, reason)),
            }
        }

        if problems.is_empty() {
            DomainReport::new(
                HealthStatus::Healthy,
                format!("{} volumes, {} attachments", records.len(), attachments),
            )
        } else {
            DomainReport::new(HealthStatus::Unhealthy, problems.join(", "))
        }
    }

    async fn describe_all<'a>(
        &self,
        records: &'a [ResourceRecord],
    ) -> Vec<(&'a ResourceRecord, Result<ResourceDescription, String>)> {
        let calls = records.iter().map(|record| async move {
            let outcome = self
                .cloud
                .describe_resource(&record.resource_id)
                .await
                .map_err(|e| e.to_string());
            (record, outcome)
        });
        join_all(calls).await
    }
}
