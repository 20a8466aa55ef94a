//! The scheduler queues requests from frontends and dispatches them to queriers.
//!
//! Lock discipline: the frontend registry and the pending request map are separate mutexes
//! and neither is held across an await point. The pending request map may be locked while
//! the queue lock is held (in the enqueue callback) but never the other way around.

mod frontend;
mod options;
mod querier;
mod server;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fastrace::Span;
use ferry_server::{ServiceState, ServiceStateCell};
use ferry_telemetry::metrics::MetricRegistry;
use futures::{Stream, StreamExt};
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::Status;

pub use options::{SchedulerOptions, SchedulerRingOptions};
pub use server::{LoopStream, SchedulerServer};

use crate::discovery::RingLifecycler;
use crate::error::{SchedulingError, SchedulingResult};
use crate::proto::http::HttpRequest;
use crate::queue::RequestQueue;

const INFLIGHT_SAMPLE_PERIOD: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RequestKey {
    frontend_address: String,
    query_id: u64,
}

impl RequestKey {
    fn new(frontend_address: impl Into<String>, query_id: u64) -> Self {
        Self {
            frontend_address: frontend_address.into(),
            query_id,
        }
    }
}

/// A request that has been accepted by the queue and not yet completed.
pub(crate) struct SchedulerRequest {
    frontend_address: String,
    tenant_id: String,
    query_id: u64,
    http_request: HttpRequest,
    stats_enabled: bool,
    enqueue_time: Instant,
    /// Cancelled when the frontend cancels the request or disconnects.
    token: CancellationToken,
    /// The span covering the time in the queue, chained to the trace of the HTTP request.
    queue_span: Mutex<Option<Span>>,
}

impl SchedulerRequest {
    fn key(&self) -> RequestKey {
        RequestKey::new(&self.frontend_address, self.query_id)
    }

    fn finish_queue_span(&self) {
        if let Ok(mut span) = self.queue_span.lock() {
            // The span is submitted when dropped.
            span.take();
        }
    }
}

struct ConnectedFrontend {
    connections: usize,
    token: CancellationToken,
}

pub struct Scheduler {
    options: SchedulerOptions,
    state: ServiceStateCell,
    queue: Arc<RequestQueue<Arc<SchedulerRequest>>>,
    connected_frontends: Mutex<HashMap<String, ConnectedFrontend>>,
    pending_requests: Mutex<HashMap<RequestKey, Arc<SchedulerRequest>>>,
    connected_querier_clients: AtomicUsize,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    ring_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    metrics: Arc<MetricRegistry>,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions, metrics: Arc<MetricRegistry>) -> Self {
        let queue = RequestQueue::new(
            options.max_outstanding_requests_per_tenant,
            options.querier_forget_delay,
            Arc::clone(&metrics),
        );
        Self {
            options,
            state: ServiceStateCell::new(),
            queue: Arc::new(queue),
            connected_frontends: Mutex::new(HashMap::new()),
            pending_requests: Mutex::new(HashMap::new()),
            connected_querier_clients: AtomicUsize::new(0),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            ring_task: Mutex::new(None),
            metrics,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state.get()
    }

    /// Starts the background tasks and moves the scheduler to the running state.
    pub async fn start(self: &Arc<Self>) -> SchedulingResult<()> {
        if !self
            .state
            .transition(ServiceState::New, ServiceState::Starting)
        {
            return Err(SchedulingError::internal(format!(
                "cannot start the scheduler in state {}",
                self.state.get()
            )));
        }
        if let Err(e) = self.start_ring_lifecycler().await {
            self.state.set(ServiceState::Failed);
            return Err(e);
        }

        let queue = Arc::clone(&self.queue);
        let token = self.shutdown.child_token();
        self.tasks
            .spawn(async move { queue.run_forget_loop(token).await });

        let scheduler = Arc::clone(self);
        let token = self.shutdown.child_token();
        self.tasks
            .spawn(async move { scheduler.run_metrics_sampler(token).await });

        self.state.set(ServiceState::Running);
        info!("scheduler started");
        Ok(())
    }

    async fn start_ring_lifecycler(&self) -> SchedulingResult<()> {
        let Some(ring) = &self.options.ring else {
            return Ok(());
        };
        let lifecycler = RingLifecycler::new(
            Arc::clone(&ring.ring),
            ring.instance_id.clone(),
            ring.instance_address.clone(),
            ring.heartbeat_period,
        );
        lifecycler.join().await?;
        let token = self.shutdown.child_token();
        let handle = {
            let token = token.clone();
            tokio::spawn(async move {
                lifecycler.run(token).await;
                if let Err(e) = lifecycler.leave().await {
                    warn!("failed to leave the ring: {e}");
                }
            })
        };
        *self.ring_task.lock()? = Some((token, handle));
        Ok(())
    }

    /// Stops accepting requests, drains the queue, and waits for the background tasks.
    pub async fn stop(&self) -> SchedulingResult<()> {
        match self.state.get() {
            ServiceState::Stopping | ServiceState::Terminated | ServiceState::Failed => {
                return Ok(());
            }
            _ => {}
        }
        self.state.set(ServiceState::Stopping);
        info!("scheduler stopping");

        let ring_task = self.ring_task.lock()?.take();
        if let Some((token, handle)) = ring_task {
            token.cancel();
            handle.await?;
        }
        let result = self.queue.stop().await;
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.state.set(ServiceState::Terminated);
        info!("scheduler stopped");
        result
    }

    async fn run_metrics_sampler(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(INFLIGHT_SAMPLE_PERIOD);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => self.sample_metrics(),
            }
        }
    }

    fn sample_metrics(&self) {
        self.metrics
            .scheduler_inflight_requests
            .record(self.pending_request_count() as u64, &[]);
        self.metrics
            .scheduler_connected_frontend_clients
            .record(self.connected_frontend_clients() as u64, &[]);
        self.metrics
            .scheduler_connected_querier_clients
            .record(self.connected_querier_clients() as u64, &[]);
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending_requests.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// The number of open frontend streams.
    pub fn connected_frontend_clients(&self) -> usize {
        self.connected_frontends
            .lock()
            .map(|f| f.values().map(|x| x.connections).sum())
            .unwrap_or(0)
    }

    /// The number of open querier streams.
    pub fn connected_querier_clients(&self) -> usize {
        self.connected_querier_clients.load(Ordering::SeqCst)
    }

    pub fn notify_querier_shutdown(&self, querier_id: &str) -> SchedulingResult<()> {
        self.queue.notify_querier_shutdown(querier_id)
    }

    fn frontend_connected(&self, address: &str) -> SchedulingResult<CancellationToken> {
        let mut frontends = self.connected_frontends.lock()?;
        let frontend = frontends
            .entry(address.to_string())
            .or_insert_with(|| ConnectedFrontend {
                connections: 0,
                token: CancellationToken::new(),
            });
        frontend.connections += 1;
        Ok(frontend.token.clone())
    }

    fn frontend_disconnected(&self, address: &str) {
        let Ok(mut frontends) = self.connected_frontends.lock() else {
            return;
        };
        let Some(frontend) = frontends.get_mut(address) else {
            return;
        };
        frontend.connections = frontend.connections.saturating_sub(1);
        if frontend.connections > 0 {
            return;
        }
        if let Some(frontend) = frontends.remove(address) {
            // Cancels every request of this frontend that is still queued or in progress.
            frontend.token.cancel();
        }
        drop(frontends);
        // A new stream from the same address may have enqueued requests in the meantime.
        if let Ok(mut pending) = self.pending_requests.lock() {
            pending.retain(|key, request| {
                key.frontend_address != address || !request.token.is_cancelled()
            });
        }
    }

    fn cancel_request_and_remove_from_pending(
        &self,
        frontend_address: &str,
        query_id: u64,
    ) -> SchedulingResult<()> {
        let key = RequestKey::new(frontend_address, query_id);
        let mut pending = self.pending_requests.lock()?;
        if let Some(request) = pending.remove(&key) {
            request.token.cancel();
        }
        Ok(())
    }

    /// Cancels the request and removes it from the pending map
    /// if the map still refers to this request.
    fn complete_request(&self, request: &Arc<SchedulerRequest>) {
        request.token.cancel();
        let key = request.key();
        if let Ok(mut pending) = self.pending_requests.lock() {
            if pending
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, request))
            {
                pending.remove(&key);
            }
        }
    }
}

/// Removes the frontend connection when the frontend loop ends.
struct FrontendConnection<'a> {
    scheduler: &'a Scheduler,
    address: String,
}

impl Drop for FrontendConnection<'_> {
    fn drop(&mut self) {
        self.scheduler.frontend_disconnected(&self.address);
    }
}

/// Unregisters the querier connection when the querier loop ends.
struct QuerierConnection<'a> {
    scheduler: &'a Scheduler,
    querier_id: String,
}

impl Drop for QuerierConnection<'_> {
    fn drop(&mut self) {
        self.scheduler
            .connected_querier_clients
            .fetch_sub(1, Ordering::SeqCst);
        if let Err(e) = self
            .scheduler
            .queue
            .unregister_querier_connection(&self.querier_id)
        {
            warn!("failed to unregister querier {}: {e}", self.querier_id);
        }
    }
}

/// Receives the next message unless the stream context is cancelled first.
async fn recv<S, M>(stream: &mut S, ctx: &CancellationToken) -> SchedulingResult<Option<M>>
where
    S: Stream<Item = Result<M, Status>> + Unpin,
{
    tokio::select! {
        _ = ctx.cancelled() => Err(SchedulingError::cancelled("stream context cancelled")),
        message = stream.next() => Ok(message.transpose()?),
    }
}

async fn send<M>(tx: &mpsc::Sender<Result<M, Status>>, message: M) -> SchedulingResult<()> {
    tx.send(Ok(message))
        .await
        .map_err(|_| SchedulingError::cancelled("stream closed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> Scheduler {
        Scheduler::new(
            SchedulerOptions::default(),
            Arc::new(MetricRegistry::global()),
        )
    }

    fn request(frontend_address: &str, query_id: u64, token: CancellationToken) -> Arc<SchedulerRequest> {
        Arc::new(SchedulerRequest {
            frontend_address: frontend_address.to_string(),
            tenant_id: "test".to_string(),
            query_id,
            http_request: HttpRequest::default(),
            stats_enabled: false,
            enqueue_time: Instant::now(),
            token,
            queue_span: Mutex::new(None),
        })
    }

    fn add_pending(scheduler: &Scheduler, request: &Arc<SchedulerRequest>) -> SchedulingResult<()> {
        scheduler
            .pending_requests
            .lock()?
            .insert(request.key(), Arc::clone(request));
        Ok(())
    }

    #[test]
    fn test_last_frontend_connection_cancels_requests() -> SchedulingResult<()> {
        let scheduler = scheduler();
        let token = scheduler.frontend_connected("frontend-1")?;
        let _ = scheduler.frontend_connected("frontend-1")?;
        let other = scheduler.frontend_connected("frontend-2")?;
        let first = request("frontend-1", 1, token.child_token());
        let second = request("frontend-2", 1, other.child_token());
        add_pending(&scheduler, &first)?;
        add_pending(&scheduler, &second)?;
        assert_eq!(scheduler.connected_frontend_clients(), 3);

        scheduler.frontend_disconnected("frontend-1");
        assert!(!first.token.is_cancelled());
        assert_eq!(scheduler.pending_request_count(), 2);

        scheduler.frontend_disconnected("frontend-1");
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        assert_eq!(scheduler.pending_request_count(), 1);
        assert_eq!(scheduler.connected_frontend_clients(), 1);
        Ok(())
    }

    #[test]
    fn test_frontend_disconnect_keeps_requests_of_new_connection() -> SchedulingResult<()> {
        let scheduler = scheduler();
        let token = scheduler.frontend_connected("frontend-1")?;
        let old = request("frontend-1", 1, token.child_token());
        let new = request("frontend-1", 2, CancellationToken::new());
        add_pending(&scheduler, &old)?;
        add_pending(&scheduler, &new)?;

        scheduler.frontend_disconnected("frontend-1");
        assert!(old.token.is_cancelled());
        assert!(!new.token.is_cancelled());
        assert_eq!(scheduler.pending_request_count(), 1);
        scheduler.cancel_request_and_remove_from_pending("frontend-1", 2)?;
        assert!(new.token.is_cancelled());
        assert_eq!(scheduler.pending_request_count(), 0);
        Ok(())
    }

    #[test]
    fn test_complete_request_keeps_replacement() -> SchedulingResult<()> {
        let scheduler = scheduler();
        let old = request("frontend-1", 1, CancellationToken::new());
        let new = request("frontend-1", 1, CancellationToken::new());
        add_pending(&scheduler, &old)?;
        add_pending(&scheduler, &new)?;

        scheduler.complete_request(&old);
        assert!(old.token.is_cancelled());
        assert_eq!(scheduler.pending_request_count(), 1);

        scheduler.complete_request(&new);
        assert_eq!(scheduler.pending_request_count(), 0);
        Ok(())
    }

    #[test]
    fn test_cancel_request_removes_pending() -> SchedulingResult<()> {
        let scheduler = scheduler();
        let request = request("frontend-1", 5, CancellationToken::new());
        add_pending(&scheduler, &request)?;

        scheduler.cancel_request_and_remove_from_pending("frontend-1", 6)?;
        assert_eq!(scheduler.pending_request_count(), 1);
        scheduler.cancel_request_and_remove_from_pending("frontend-1", 5)?;
        assert!(request.token.is_cancelled());
        assert_eq!(scheduler.pending_request_count(), 0);
        Ok(())
    }
}
