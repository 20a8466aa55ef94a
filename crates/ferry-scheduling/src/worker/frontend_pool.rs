use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferry_common::config::FrontendPoolConfig;
use ferry_telemetry::metrics::MetricRegistry;
use log::{debug, warn};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

use crate::error::{SchedulingError, SchedulingResult};
use crate::proto::frontend::FrontendForQuerierClient;
use crate::rpc::{ClientBuilder, ClientHandle, ClientOptions, CLIENT_MAX_MESSAGE_SIZE};

/// A connection to a frontend with the result service and the health service.
#[derive(Debug, Clone)]
pub struct FrontendClient {
    pub query: FrontendForQuerierClient<Channel>,
    health: HealthClient<Channel>,
}

#[tonic::async_trait]
impl ClientBuilder for FrontendClient {
    async fn connect(options: &ClientOptions) -> SchedulingResult<Self> {
        let channel = options.endpoint()?.connect().await?;
        let query = FrontendForQuerierClient::new(channel.clone())
            .max_decoding_message_size(CLIENT_MAX_MESSAGE_SIZE)
            .max_encoding_message_size(CLIENT_MAX_MESSAGE_SIZE);
        Ok(Self {
            query,
            health: HealthClient::new(channel),
        })
    }
}

impl FrontendClient {
    async fn check_health(&mut self, timeout: Duration) -> SchedulingResult<()> {
        let request = HealthCheckRequest {
            service: String::new(),
        };
        let response = tokio::time::timeout(timeout, self.health.check(request))
            .await
            .map_err(|_| SchedulingError::internal("health check timed out"))??;
        match response.into_inner().status() {
            ServingStatus::Serving => Ok(()),
            status => Err(SchedulingError::internal(format!(
                "frontend is not serving: {}",
                status.as_str_name()
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrontendPoolOptions {
    pub check_interval: Duration,
    pub health_check_timeout: Duration,
    /// The connect and request timeout of the result delivery.
    pub client_timeout: Duration,
}

impl FrontendPoolOptions {
    pub fn new(config: &FrontendPoolConfig) -> Self {
        Self {
            check_interval: Duration::from_secs(config.check_interval_secs),
            health_check_timeout: Duration::from_secs(config.health_check_timeout_secs),
            client_timeout: Duration::from_secs(config.client_timeout_secs),
        }
    }
}

/// Frontend clients shared by all processor tasks of a querier, keyed by frontend address.
pub struct FrontendPool {
    options: FrontendPoolOptions,
    clients: Mutex<HashMap<String, ClientHandle<FrontendClient>>>,
    metrics: Arc<MetricRegistry>,
}

impl FrontendPool {
    pub fn new(options: FrontendPoolOptions, metrics: Arc<MetricRegistry>) -> Self {
        Self {
            options,
            clients: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub async fn get_client(&self, address: &str) -> SchedulingResult<FrontendClient> {
        let handle = {
            let mut clients = self.clients.lock()?;
            let handle = clients
                .entry(address.to_string())
                .or_insert_with(|| ClientHandle::new(self.client_options(address)))
                .clone();
            self.metrics
                .querier_frontend_clients
                .record(clients.len() as u64, &[]);
            handle
        };
        handle.get().await
    }

    fn client_options(&self, address: &str) -> ClientOptions {
        ClientOptions {
            connect_timeout: Some(self.options.client_timeout),
            request_timeout: Some(self.options.client_timeout),
            ..ClientOptions::new(address)
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, address: &str) -> SchedulingResult<()> {
        let mut clients = self.clients.lock()?;
        clients.remove(address);
        self.metrics
            .querier_frontend_clients
            .record(clients.len() as u64, &[]);
        Ok(())
    }

    /// Checks every pooled client periodically and evicts the unhealthy ones.
    pub async fn run_health_checks(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.options.check_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => self.check_clients().await,
            }
        }
        debug!("frontend pool health checks stopped");
    }

    async fn check_clients(&self) {
        let handles = match self.clients.lock() {
            Ok(clients) => clients
                .iter()
                .map(|(address, handle)| (address.clone(), handle.clone()))
                .collect::<Vec<_>>(),
            Err(_) => return,
        };
        for (address, handle) in handles {
            let result = match handle.get().await {
                Ok(mut client) => client.check_health(self.options.health_check_timeout).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("removing frontend {address} from the pool: {e}");
                if let Err(e) = self.remove(&address) {
                    warn!("failed to remove frontend {address}: {e}");
                }
            }
        }
    }
}
