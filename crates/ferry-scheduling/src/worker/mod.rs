//! The querier side: one processor manager per discovered scheduler,
//! each running a share of the querier's concurrency.

mod frontend_pool;
mod manager;
mod processor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{error, info};
use tonic::transport::Channel;

pub use frontend_pool::{FrontendClient, FrontendPool, FrontendPoolOptions};
pub use manager::ProcessorManager;
pub use processor::{
    HandlerError, Processor, RequestContext, RequestHandler, SchedulerProcessor,
    SchedulerProcessorOptions,
};

use crate::discovery::{Instance, Notifications};
use crate::error::SchedulingResult;
use crate::rpc::ClientOptions;

/// Returns the configured querier ID, or the host name, or a random ID.
pub fn querier_id(configured: &str) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }
    match std::env::var("HOSTNAME") {
        Ok(hostname) if !hostname.is_empty() => hostname,
        _ => uuid::Uuid::new_v4().to_string(),
    }
}

/// Splits the querier concurrency among the instances.
///
/// Every instance gets at least one task. Instances in use share `max_concurrent` evenly,
/// and the remainder goes to the in-use instances with the smallest addresses.
pub fn desired_concurrency(
    instances: &HashMap<String, Instance>,
    max_concurrent: usize,
) -> HashMap<String, usize> {
    let mut in_use = instances
        .values()
        .filter(|x| x.in_use)
        .map(|x| x.address.as_str())
        .collect::<Vec<_>>();
    in_use.sort();
    let mut result = instances
        .values()
        .filter(|x| !x.in_use)
        .map(|x| (x.address.clone(), 1))
        .collect::<HashMap<_, _>>();
    if in_use.is_empty() {
        return result;
    }
    let base = max_concurrent / in_use.len();
    let mut remainder = max_concurrent % in_use.len();
    for address in in_use {
        let mut concurrency = base;
        if remainder > 0 {
            concurrency += 1;
            remainder -= 1;
        }
        result.insert(address.to_string(), concurrency.max(1));
    }
    result
}

#[derive(Default)]
struct WorkerState {
    managers: HashMap<String, ProcessorManager>,
    instances: HashMap<String, Instance>,
    stopped: bool,
}

impl WorkerState {
    fn apply_concurrency(&mut self, max_concurrent: usize) {
        let desired = desired_concurrency(&self.instances, max_concurrent);
        for (address, manager) in self.managers.iter_mut() {
            let n = desired.get(address).copied().unwrap_or(1);
            manager.concurrency(n);
        }
    }
}

/// Keeps a processor manager for every instance reported by the service discovery.
pub struct QuerierWorker {
    processor: Arc<dyn Processor>,
    max_concurrent_requests: usize,
    state: Mutex<WorkerState>,
}

impl QuerierWorker {
    pub fn new(processor: Arc<dyn Processor>, max_concurrent_requests: usize) -> Self {
        Self {
            processor,
            max_concurrent_requests,
            state: Mutex::new(WorkerState::default()),
        }
    }

    pub fn manager_count(&self) -> usize {
        self.state.lock().map(|s| s.managers.len()).unwrap_or(0)
    }

    /// The target concurrency of the manager for the address, if any.
    pub fn concurrency(&self, address: &str) -> Option<usize> {
        let state = self.state.lock().ok()?;
        state.managers.get(address).map(|m| m.concurrency_target())
    }

    fn add_instance(&self, instance: Instance) -> SchedulingResult<()> {
        let mut state = self.state.lock()?;
        if state.stopped || state.managers.contains_key(&instance.address) {
            return Ok(());
        }
        let channel: Channel = ClientOptions::new(&instance.address)
            .endpoint()?
            .connect_lazy();
        let manager = ProcessorManager::new(Arc::clone(&self.processor), channel, &instance.address);
        info!(
            "adding connection to scheduler {} (in use: {})",
            instance.address, instance.in_use
        );
        state.managers.insert(instance.address.clone(), manager);
        state.instances.insert(instance.address.clone(), instance);
        state.apply_concurrency(self.max_concurrent_requests);
        Ok(())
    }

    fn remove_instance(&self, instance: &Instance) -> SchedulingResult<Option<ProcessorManager>> {
        let mut state = self.state.lock()?;
        let manager = state.managers.remove(&instance.address);
        state.instances.remove(&instance.address);
        state.apply_concurrency(self.max_concurrent_requests);
        Ok(manager)
    }

    fn change_instance(&self, instance: Instance) -> SchedulingResult<()> {
        let mut state = self.state.lock()?;
        if !state.managers.contains_key(&instance.address) {
            error!(
                "received a notification about unknown scheduler instance {}",
                instance.address
            );
            return Ok(());
        }
        info!(
            "updating connection to scheduler {} (in use: {})",
            instance.address, instance.in_use
        );
        state.instances.insert(instance.address.clone(), instance);
        state.apply_concurrency(self.max_concurrent_requests);
        Ok(())
    }

    /// Stops every processor manager. Later instance notifications are ignored.
    pub async fn stop(&self) -> SchedulingResult<()> {
        let managers = {
            let mut state = self.state.lock()?;
            state.stopped = true;
            state.instances.clear();
            std::mem::take(&mut state.managers)
        };
        for (_, manager) in managers {
            manager.stop().await;
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl Notifications for QuerierWorker {
    async fn instance_added(&self, instance: Instance) {
        let address = instance.address.clone();
        if let Err(e) = self.add_instance(instance) {
            error!("failed to add scheduler instance {address}: {e}");
        }
    }

    async fn instance_removed(&self, instance: Instance) {
        match self.remove_instance(&instance) {
            Ok(Some(manager)) => {
                info!("removing connection to scheduler {}", instance.address);
                manager.stop().await;
            }
            Ok(None) => {}
            Err(e) => error!("failed to remove scheduler instance {}: {e}", instance.address),
        }
    }

    async fn instance_changed(&self, instance: Instance) {
        let address = instance.address.clone();
        if let Err(e) = self.change_instance(instance) {
            error!("failed to update scheduler instance {address}: {e}");
        }
    }
}
