/// Health notifications
use super::{HealthDomain, HealthSnapshot, HealthStatus};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub id: Uuid,
    pub stack_id: String,
    pub overall: HealthStatus,

    /// Overall status of the last notified snapshot, if any
    pub previous: Option<HealthStatus>,

    pub problems: Vec<(HealthDomain, HealthStatus, String)>,
    pub timestamp: DateTime<Utc>,
}

impl HealthAlert {
    pub fn from_snapshot(snapshot: &HealthSnapshot, previous: Option<HealthStatus>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stack_id: snapshot.stack_id.clone(),
            overall: snapshot.overall,
            previous,
            problems: snapshot
                .problems()
                .into_iter()
                .map(|(domain, report)| (domain, report.status, report.detail.clone()))
                .collect(),
            timestamp: snapshot.timestamp,
        }
    }

    pub fn summary(&self) -> String {
        let domains: Vec<String> = self
            .problems
            .iter()
            .map(|(domain, status, _)| format!("{}={}", domain, status))
            .collect();
        format!("{} is {} [{}]", self.stack_id, self.overall, domains.join(", "))
    }
}

/// Delivery channel for health alerts
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &HealthAlert) -> Result<()>;
}

/// Emits alerts through the tracing pipeline
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &HealthAlert) -> Result<()> {
        tracing::warn!(
            alert_id = %alert.id,
            stack_id = %alert.stack_id,
            overall = %alert.overall,
            previous = ?alert.previous,
            "Health alert: {}",
            alert.summary()
        );
        Ok(())
    }
}

/// Per-stack cool-down between notifications for the same overall status
///
/// A change of overall status always notifies. A healthy snapshot never
/// notifies and clears what was remembered for that stack only.
pub struct NotificationGate {
    cooldown: Duration,
    last: Mutex<HashMap<String, (HealthStatus, DateTime<Utc>)>>,
}

impl NotificationGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Decide whether `overall` observed for `stack_id` at `now` should
    /// notify. Returns the previously notified status (wrapped) when it
    /// should.
    pub fn admit(
        &self,
        stack_id: &str,
        overall: HealthStatus,
        now: DateTime<Utc>,
    ) -> Option<Option<HealthStatus>> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());

        if overall == HealthStatus::Healthy {
            last.remove(stack_id);
            return None;
        }

        let remembered = last.get(stack_id).copied();
        let due = match remembered {
            None => true,
            Some((status, _)) if status != overall => true,
            Some((_, at)) => now
                .signed_duration_since(at)
                .to_std()
                .map(|elapsed| elapsed >= self.cooldown)
                .unwrap_or(false),
        };

        if due {
            last.insert(stack_id.to_string(), (overall, now));
            Some(remembered.map(|(status, _)| status))
        } else {
            None
        }
    }
}

impl Default for NotificationGate {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}
