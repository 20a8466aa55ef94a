use std::sync::Arc;
use std::time::Duration;

use ferry_common::config::{AppConfig, ServiceDiscoveryMode};

use crate::discovery::Ring;
use crate::tenant::{Limits, StaticLimits};

pub struct SchedulerOptions {
    pub max_outstanding_requests_per_tenant: usize,
    pub querier_forget_delay: Duration,
    pub frontend_client_timeout: Duration,
    pub limits: Arc<dyn Limits>,
    /// Set when the scheduler registers itself in a membership ring.
    pub ring: Option<SchedulerRingOptions>,
}

pub struct SchedulerRingOptions {
    pub ring: Arc<dyn Ring>,
    pub instance_id: String,
    pub instance_address: String,
    pub heartbeat_period: Duration,
}

impl SchedulerOptions {
    pub fn new(config: &AppConfig, ring: Option<Arc<dyn Ring>>) -> Self {
        let ring = match (config.service_discovery.mode, ring) {
            (ServiceDiscoveryMode::Ring, Some(ring)) => Some(SchedulerRingOptions {
                ring,
                instance_id: non_empty_or(&config.scheduler.instance_id, || {
                    format!("scheduler-{}", config.scheduler.listen_port)
                }),
                instance_address: non_empty_or(&config.scheduler.instance_address, || {
                    format!(
                        "{}:{}",
                        config.scheduler.listen_host, config.scheduler.listen_port
                    )
                }),
                heartbeat_period: Duration::from_secs(config.scheduler.ring_heartbeat_period_secs),
            }),
            _ => None,
        };
        Self {
            max_outstanding_requests_per_tenant: config
                .scheduler
                .max_outstanding_requests_per_tenant,
            querier_forget_delay: Duration::from_secs(config.scheduler.querier_forget_delay_secs),
            frontend_client_timeout: Duration::from_secs(
                config.scheduler.frontend_client_timeout_secs,
            ),
            limits: Arc::new(StaticLimits {
                max_queriers_per_tenant: config.scheduler.max_queriers_per_tenant,
            }),
            ring,
        }
    }
}

fn non_empty_or(value: &str, default: impl FnOnce() -> String) -> String {
    if value.is_empty() {
        default()
    } else {
        value.to_string()
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_outstanding_requests_per_tenant: 100,
            querier_forget_delay: Duration::ZERO,
            frontend_client_timeout: Duration::from_secs(5),
            limits: Arc::new(StaticLimits::default()),
            ring: None,
        }
    }
}
