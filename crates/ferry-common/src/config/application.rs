use std::path::Path;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub querier: QuerierConfig,
    pub frontend_pool: FrontendPoolConfig,
    pub service_discovery: ServiceDiscoveryConfig,
    pub runtime: RuntimeConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Loads the configuration from the built-in defaults, an optional TOML file,
    /// and `FERRY__`-prefixed environment variables, in increasing priority.
    pub fn load(path: Option<&Path>) -> CommonResult<Self> {
        let mut figment = Figment::from(Toml::string(DEFAULT_CONFIG));
        if let Some(path) = path {
            figment = figment.admerge(Toml::file(path));
        }
        let config: Self = figment
            .admerge(Env::prefixed("FERRY__").map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| CommonError::InvalidArgument(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CommonResult<()> {
        self.service_discovery.validate()?;
        if self.service_discovery.mode == ServiceDiscoveryMode::Ring
            && !self.querier.scheduler_address.is_empty()
        {
            return Err(CommonError::invalid(format!(
                "scheduler address cannot be specified when service discovery mode is set to '{}'",
                self.service_discovery.mode
            )));
        }
        Ok(())
    }

    /// Checks the settings that only matter when this process runs a querier.
    pub fn validate_querier(&self) -> CommonResult<()> {
        if self.service_discovery.mode == ServiceDiscoveryMode::Dns
            && self.querier.scheduler_address.is_empty()
        {
            return Err(CommonError::missing("querier scheduler address"));
        }
        if self.querier.max_concurrent_requests == 0 {
            return Err(CommonError::invalid(
                "the max concurrent requests must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub max_outstanding_requests_per_tenant: usize,
    /// How long a querier that disconnected without a shutdown notification
    /// keeps counting towards the shuffle shards of its tenants.
    pub querier_forget_delay_secs: u64,
    pub max_queriers_per_tenant: usize,
    pub frontend_client_timeout_secs: u64,
    /// The ring member ID of this scheduler, only used in ring mode.
    pub instance_id: String,
    /// The address advertised in the ring, only used in ring mode.
    pub instance_address: String,
    pub ring_heartbeat_period_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerierConfig {
    /// Defaults to the host name when empty.
    pub id: String,
    pub scheduler_address: String,
    pub max_concurrent_requests: usize,
    pub max_send_message_size: usize,
    pub dns_lookup_period_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendPoolConfig {
    pub check_interval_secs: u64,
    pub health_check_timeout_secs: u64,
    /// The connect and request timeout when sending results to a frontend.
    pub client_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceDiscoveryMode {
    Dns,
    Ring,
}

impl std::fmt::Display for ServiceDiscoveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceDiscoveryMode::Dns => write!(f, "dns"),
            ServiceDiscoveryMode::Ring => write!(f, "ring"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDiscoveryConfig {
    pub mode: ServiceDiscoveryMode,
    /// The maximum number of ring instances to use, or 0 for no limit.
    pub max_used_instances: i64,
    pub ring_check_period_secs: u64,
    pub ring_heartbeat_timeout_secs: u64,
}

impl ServiceDiscoveryConfig {
    pub fn validate(&self) -> CommonResult<()> {
        if self.max_used_instances < 0 {
            return Err(CommonError::invalid(
                "the max used instances must be greater than or equal to 0",
            ));
        }
        if self.max_used_instances > 0 && self.mode != ServiceDiscoveryMode::Ring {
            return Err(CommonError::invalid(format!(
                "the max used instances can only be set when service discovery mode is '{}'",
                ServiceDiscoveryMode::Ring
            )));
        }
        Ok(())
    }

    pub fn max_used_instances(&self) -> usize {
        usize::try_from(self.max_used_instances).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub stack_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub trace_to_console: bool,
}
