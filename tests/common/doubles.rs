use anyhow::Result;
use async_trait::async_trait;
use gpu_stack_deploy::error::ErrorCode;
use gpu_stack_deploy::health::{HealthAlert, Notifier};
use gpu_stack_deploy::validation::{Check, CheckFailure, CheckOutcome, ValidationType};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Keeps every alert it receives
#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<HealthAlert>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<HealthAlert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: &HealthAlert) -> Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Check that counts its executions and passes or fails on demand
pub struct CountingCheck {
    validation_type: ValidationType,
    runs: AtomicU32,
    failing: Mutex<Option<ErrorCode>>,
}

impl CountingCheck {
    pub fn passing(validation_type: ValidationType) -> Self {
        Self {
            validation_type,
            runs: AtomicU32::new(0),
            failing: Mutex::new(None),
        }
    }

    pub fn failing(validation_type: ValidationType, code: ErrorCode) -> Self {
        let check = Self::passing(validation_type);
        *check.failing.lock().unwrap() = Some(code);
        check
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Check for CountingCheck {
    fn validation_type(&self) -> ValidationType {
        self.validation_type
    }

    async fn execute(&self) -> CheckOutcome {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        match self.failing.lock().unwrap().clone() {
            Some(code) => Err(CheckFailure::new(code, format!("run {} failed", run))),
            None => Ok(format!("run {}", run)),
        }
    }
}
