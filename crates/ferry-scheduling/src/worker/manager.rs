use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::Channel;

use crate::worker::processor::Processor;

/// Runs a varying number of processor tasks against one scheduler address.
///
/// Lowering the concurrency only cancels the tokens of the surplus tasks.
/// The tasks exit on their own once the request in progress, if any, completes.
pub struct ProcessorManager {
    processor: Arc<dyn Processor>,
    channel: Channel,
    address: String,
    tasks: TaskTracker,
    token: CancellationToken,
    slots: Vec<CancellationToken>,
    running: Arc<AtomicUsize>,
}

impl ProcessorManager {
    pub fn new(processor: Arc<dyn Processor>, channel: Channel, address: impl Into<String>) -> Self {
        Self {
            processor,
            channel,
            address: address.into(),
            tasks: TaskTracker::new(),
            token: CancellationToken::new(),
            slots: vec![],
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The target number of processor tasks.
    pub fn concurrency_target(&self) -> usize {
        self.slots.len()
    }

    /// The number of processor tasks that have not exited yet.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn concurrency(&mut self, n: usize) {
        while self.slots.len() < n {
            let token = self.token.child_token();
            let processor = Arc::clone(&self.processor);
            let channel = self.channel.clone();
            let address = self.address.clone();
            let running = Arc::clone(&self.running);
            let slot = token.clone();
            running.fetch_add(1, Ordering::SeqCst);
            self.tasks.spawn(async move {
                processor
                    .process_queries_on_single_stream(slot, channel, &address)
                    .await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
            self.slots.push(token);
        }
        while self.slots.len() > n {
            if let Some(token) = self.slots.pop() {
                token.cancel();
            }
        }
    }

    /// Stops all processor tasks, waits for them to exit,
    /// and then tells the scheduler that this querier is going away.
    pub async fn stop(mut self) {
        self.concurrency(0);
        self.token.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        debug!("processor manager for {} stopped", self.address);
        self.processor
            .notify_shutdown(self.channel.clone(), &self.address)
            .await;
    }
}
