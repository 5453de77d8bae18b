//! Controller runtime knobs. Defaults can be overridden through `MESHSPLIT_*`
//! environment variables; the CLI layers its flags on top.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Maximum reconciles running at once.
    pub concurrency: usize,
    /// Capacity of the notification feed and enqueue channels. The work queue
    /// itself holds one entry per distinct key and never drops.
    pub queue_cap: usize,
    /// First retry delay after a failed reconcile; doubles per consecutive failure.
    pub backoff_base: Duration,
    /// Retry delay ceiling, also used for non-retryable failures.
    pub backoff_max: Duration,
    /// Watch a single namespace instead of the whole cluster.
    pub namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queue_cap: 2048,
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_secs(300),
            namespace: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            concurrency: env_parse::<usize>("MESHSPLIT_CONCURRENCY").unwrap_or(d.concurrency).max(1),
            queue_cap: env_parse::<usize>("MESHSPLIT_QUEUE_CAP").unwrap_or(d.queue_cap).max(1),
            backoff_base: env_parse::<u64>("MESHSPLIT_BACKOFF_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.backoff_base),
            backoff_max: env_parse::<u64>("MESHSPLIT_BACKOFF_MAX_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.backoff_max),
            namespace: std::env::var("MESHSPLIT_NAMESPACE").ok().filter(|s| !s.is_empty()),
        }
    }

    /// Delay before retrying after `failures` consecutive failures (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.backoff_base.saturating_mul(1u32 << exp).min(self.backoff_max)
    }
}
