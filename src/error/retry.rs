/// Retry with exponential backoff and jitter
///
/// delay = base * 2^attempt, capped at `max_delay`, then spread by a random
/// jitter of up to `jitter` of the capped delay in either direction.
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,

    #[serde(with = "duration_ms")]
    pub base_delay: Duration,

    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Jitter factor (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: 0.3,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Delay to wait before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u128.saturating_pow(attempt.min(32));
        let exponential_ms = self.base_delay.as_millis().saturating_mul(factor);
        let capped_ms = exponential_ms.min(self.max_delay.as_millis());

        if self.jitter <= 0.0 || capped_ms == 0 {
            return Duration::from_millis(capped_ms as u64);
        }

        let jitter_range = capped_ms as f64 * self.jitter;
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;
        let final_ms = (capped_ms as f64 + jitter).max(0.0);

        Duration::from_millis(final_ms as u64)
    }
}

/// Run `op` until it succeeds, the error is not retryable, or the policy's
/// budget is spent. `op` receives the 0-based attempt number.
pub async fn with_retry<T, E, F, Fut, P>(policy: &RetryPolicy, mut op: F, retryable: P) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= policy.max_retries || !retryable(&e) {
                    return Err(e);
                }

                let delay = policy.delay(attempt);
                tracing::debug!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Serialize `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
