//! Timing constants from spec §3/§5/§6, gathered in one place so every
//! component reads the same numbers. `reconcile_interval`/`metrics_interval`
//! are the only two the environment config (spec §6) is allowed to override;
//! the rest are invariants of the protocol, not deployment knobs.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// T_grace: how long a stopped publisher record is retained before removal.
    pub grace_period: Duration,
    /// T_heartbeat: minimum spacing between `Heartbeat` calls for one publisher.
    pub heartbeat_interval: Duration,
    /// T_settle: delay after push-start before promoting to healthy.
    pub settle_delay: Duration,
    /// T_recon: reconciler tick period.
    pub reconcile_interval: Duration,
    /// T_metrics: metrics collector tick period.
    pub metrics_interval: Duration,
    /// T_flush: analytics batch flush period.
    pub flush_interval: Duration,
    /// Capacity of the bounded analytics channel.
    pub analytics_queue_capacity: usize,
    /// Max concurrent outbound calls from the metrics collector.
    pub metrics_concurrency: usize,
    /// Max total attempts (including the first) for an analytics batch publish.
    pub analytics_max_attempts: u32,
    /// Policy endpoint timeout and retry budget.
    pub policy_timeout: Duration,
    pub policy_max_retries: u32,
    pub policy_retry_min_backoff: Duration,
    pub policy_retry_max_backoff: Duration,
    /// Studio API / engine RPC / bus publish timeouts.
    pub studio_api_timeout: Duration,
    pub engine_rpc_timeout: Duration,
    pub bus_publish_timeout: Duration,
    /// JWT `exp` must be within this many days of now.
    pub jwt_max_exp_days: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(30),
            settle_delay: Duration::from_secs(7),
            reconcile_interval: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(10),
            flush_interval: Duration::from_secs(1),
            analytics_queue_capacity: 200_000,
            metrics_concurrency: 5,
            analytics_max_attempts: 3,
            policy_timeout: Duration::from_secs(5),
            policy_max_retries: 2,
            policy_retry_min_backoff: Duration::from_secs(1),
            policy_retry_max_backoff: Duration::from_secs(5),
            studio_api_timeout: Duration::from_secs(10),
            engine_rpc_timeout: Duration::from_secs(10),
            bus_publish_timeout: Duration::from_secs(60),
            jwt_max_exp_days: 7,
        }
    }
}
