use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::discovery::{notify_changes, Instance, Notifications};
use crate::error::SchedulingResult;

const DNS_PREFIX: &str = "dns+";

/// Resolves a `host:port` address periodically and notifies the resolved addresses.
/// DNS has no notion of standby capacity, so every instance is in use.
pub struct DnsServiceDiscovery {
    address: String,
    lookup_period: Duration,
    receiver: Arc<dyn Notifications>,
    instances: HashMap<String, Instance>,
}

impl DnsServiceDiscovery {
    pub fn new(
        address: impl Into<String>,
        lookup_period: Duration,
        receiver: Arc<dyn Notifications>,
    ) -> Self {
        let address = address.into();
        let address = address
            .strip_prefix(DNS_PREFIX)
            .map(|x| x.to_string())
            .unwrap_or(address);
        Self {
            address,
            lookup_period,
            receiver,
            instances: HashMap::new(),
        }
    }

    /// Runs the lookups until the token is cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.lookup_period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    match self.lookup().await {
                        Ok(instances) => {
                            notify_changes(self.receiver.as_ref(), &self.instances, &instances).await;
                            self.instances = instances;
                        }
                        Err(e) => {
                            warn!("failed to resolve {}: {e}", self.address);
                        }
                    }
                }
            }
        }
        debug!("DNS service discovery for {} stopped", self.address);
    }

    async fn lookup(&self) -> SchedulingResult<HashMap<String, Instance>> {
        let addresses = tokio::net::lookup_host(self.address.as_str()).await?;
        Ok(addresses
            .map(|addr| {
                let address = addr.to_string();
                (address.clone(), Instance::new(address, true))
            })
            .collect())
    }
}
