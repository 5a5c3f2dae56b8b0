//! Bounded exponential backoff for transient publish failures.

use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use super::{BusError, MessageBus};
use crate::config::defaults::PUBLISH_MAX_BACKOFF_EXPONENT;
use crate::config::PublishConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total publish attempts, the first one included
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay before the retry that follows `failures` consecutive failures.
    ///
    /// `base_delay * 2^(failures - 1)`, capped at `max_delay`. No jitter.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(PUBLISH_MAX_BACKOFF_EXPONENT);
        let factor = 1u32 << exponent;
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Longest total sleep a caller can spend in `publish_with_backoff`,
    /// jitter included.
    pub fn max_total_delay(&self) -> Duration {
        let total: Duration = (1..self.max_attempts).map(|n| self.delay_for(n)).sum();
        total + total / 10
    }

    /// `delay_for` plus up to 10% random jitter, still capped at `max_delay`.
    fn jittered_delay(&self, failures: u32) -> Duration {
        let delay = self.delay_for(failures);
        let spread = u64::try_from(delay.as_millis() / 10).unwrap_or(0);
        let jitter = if spread > 0 {
            rand::thread_rng().gen_range(0..spread)
        } else {
            0
        };
        (delay + Duration::from_millis(jitter)).min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&PublishConfig::default())
    }
}

impl From<&PublishConfig> for BackoffPolicy {
    fn from(config: &PublishConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

/// Publish, retrying transient transport errors per `policy`.
///
/// Non-transient errors are returned immediately. After the last attempt the
/// final transport error is returned to the caller.
pub async fn publish_with_backoff(
    bus: &dyn MessageBus,
    topic: &str,
    payload: &[u8],
    policy: &BackoffPolicy,
) -> Result<(), BusError> {
    let mut failures = 0u32;
    loop {
        match bus.publish(topic, payload.to_vec()).await {
            Ok(()) => {
                if failures > 0 {
                    debug!(topic, failures, "Publish succeeded after retry");
                }
                return Ok(());
            }
            Err(e) if e.is_transient() => {
                failures += 1;
                if failures >= policy.max_attempts {
                    return Err(e);
                }
                let delay = policy.jittered_delay(failures);
                warn!(
                    topic,
                    error = %e,
                    attempt = failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Publish failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
