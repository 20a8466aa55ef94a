//! A per-tenant request queue with fair dequeuing across tenants.

mod tenants;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ferry_telemetry::metrics::{MetricAttribute, MetricRegistry};
use log::{debug, error};
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub use tenants::TenantIndex;
use tenants::TenantQueues;

use crate::error::{SchedulingError, SchedulingResult};

const FORGET_CHECK_PERIOD: Duration = Duration::from_secs(5);

struct QueueState<T> {
    tenants: TenantQueues<T>,
    connected_querier_workers: usize,
    stopped: bool,
}

/// Queues requests per tenant and hands them out to queriers in round-robin order.
///
/// All state lives behind one mutex. Waiters are woken through a [`Notify`]
/// whenever a request is enqueued or dequeued, the querier set changes, or the queue stops.
pub struct RequestQueue<T> {
    max_outstanding_per_tenant: usize,
    state: Mutex<QueueState<T>>,
    notify: Notify,
    metrics: Arc<MetricRegistry>,
}

impl<T> RequestQueue<T> {
    pub fn new(
        max_outstanding_per_tenant: usize,
        forget_delay: Duration,
        metrics: Arc<MetricRegistry>,
    ) -> Self {
        Self {
            max_outstanding_per_tenant,
            state: Mutex::new(QueueState {
                tenants: TenantQueues::new(forget_delay),
                connected_querier_workers: 0,
                stopped: false,
            }),
            notify: Notify::new(),
            metrics,
        }
    }

    fn state(&self) -> SchedulingResult<MutexGuard<'_, QueueState<T>>> {
        Ok(self.state.lock()?)
    }

    /// Enqueues a request for the tenant.
    /// `on_accepted` runs while the queue lock is held, only if the request is accepted.
    pub fn enqueue_request<F>(
        &self,
        tenant: &str,
        request: T,
        max_queriers: usize,
        on_accepted: F,
    ) -> SchedulingResult<()>
    where
        F: FnOnce(),
    {
        let mut state = self.state()?;
        if state.stopped {
            return Err(SchedulingError::QueueStopped);
        }
        let rejected = match state.tenants.get_or_add_queue(tenant, max_queriers) {
            None => return Err(SchedulingError::invalid("no queue found")),
            Some(queue) if queue.requests.len() >= self.max_outstanding_per_tenant => {
                Some(queue.requests.is_empty())
            }
            Some(queue) => {
                queue.requests.push_back(request);
                None
            }
        };
        if let Some(empty) = rejected {
            if empty {
                state.tenants.delete_queue(tenant);
            }
            self.metrics
                .scheduler_discarded_requests
                .add(1, &[KeyValue::new(MetricAttribute::TENANT, tenant.to_string())]);
            return Err(SchedulingError::TooManyRequests);
        }
        self.metrics
            .scheduler_queue_length
            .add(1, &[KeyValue::new(MetricAttribute::TENANT, tenant.to_string())]);
        self.notify.notify_waiters();
        on_accepted();
        Ok(())
    }

    /// Waits for the next request that the querier is allowed to serve.
    /// Tenants are visited in round-robin order starting after `last`.
    pub async fn get_next_request_for_querier(
        &self,
        ctx: &CancellationToken,
        last: TenantIndex,
        querier_id: &str,
    ) -> SchedulingResult<(T, TenantIndex)> {
        let mut last = last;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state()?;
                if state.stopped {
                    return Err(SchedulingError::QueueStopped);
                }
                if ctx.is_cancelled() {
                    return Err(SchedulingError::cancelled("querier context cancelled"));
                }
                match state.tenants.next_tenant_for_querier(last, querier_id) {
                    Ok((tenant, index)) => {
                        last = index;
                        if let Some(request) = self.pop_request(&mut state, &tenant) {
                            // Wake up `stop()` which may be waiting for the queue to drain.
                            self.notify.notify_waiters();
                            return Ok((request, last));
                        }
                    }
                    Err(index) => last = index,
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = ctx.cancelled() => {
                    return Err(SchedulingError::cancelled("querier context cancelled"));
                }
            }
        }
    }

    fn pop_request(&self, state: &mut QueueState<T>, tenant: &str) -> Option<T> {
        let queue = state.tenants.queue_mut(tenant)?;
        let request = queue.requests.pop_front();
        if queue.requests.is_empty() {
            state.tenants.delete_queue(tenant);
        }
        if request.is_some() {
            self.metrics
                .scheduler_queue_length
                .add(-1, &[KeyValue::new(MetricAttribute::TENANT, tenant.to_string())]);
        }
        request
    }

    pub fn register_querier_connection(&self, querier_id: &str) -> SchedulingResult<()> {
        let mut state = self.state()?;
        state.connected_querier_workers += 1;
        state.tenants.add_querier_connection(querier_id);
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn unregister_querier_connection(&self, querier_id: &str) -> SchedulingResult<()> {
        let mut state = self.state()?;
        state.connected_querier_workers = state.connected_querier_workers.saturating_sub(1);
        state
            .tenants
            .remove_querier_connection(querier_id, Instant::now());
        self.notify.notify_waiters();
        Ok(())
    }

    /// Removes the querier right away instead of waiting for the forget delay.
    pub fn notify_querier_shutdown(&self, querier_id: &str) -> SchedulingResult<()> {
        let mut state = self.state()?;
        debug!("received shutdown notification from querier {querier_id}");
        state.tenants.notify_querier_shutdown(querier_id);
        self.notify.notify_waiters();
        Ok(())
    }

    fn forget_disconnected_queriers(&self) -> SchedulingResult<()> {
        let mut state = self.state()?;
        if state.tenants.forget_disconnected_queriers(Instant::now()) > 0 {
            // Removing queriers may change the shuffle shards of the tenants.
            self.notify.notify_waiters();
        }
        Ok(())
    }

    /// Periodically forgets disconnected queriers until the token is cancelled.
    pub async fn run_forget_loop(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(FORGET_CHECK_PERIOD);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.forget_disconnected_queriers() {
                        error!("failed to forget disconnected queriers: {e}");
                    }
                }
            }
        }
    }

    /// Stops the queue once it is drained or no querier is left to drain it.
    /// Every blocked dequeue then fails with [`SchedulingError::QueueStopped`].
    pub async fn stop(&self) -> SchedulingResult<()> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state()?;
                if state.tenants.is_empty() || state.connected_querier_workers == 0 {
                    state.stopped = true;
                    self.notify.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state().map(|s| s.stopped).unwrap_or(true)
    }

    /// The number of queued requests across all tenants.
    pub fn len(&self) -> usize {
        self.state().map(|s| s.tenants.request_count()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tenant_count(&self) -> usize {
        self.state().map(|s| s.tenants.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    fn queue(max_outstanding: usize) -> Arc<RequestQueue<u64>> {
        Arc::new(RequestQueue::new(
            max_outstanding,
            Duration::ZERO,
            Arc::new(MetricRegistry::global()),
        ))
    }

    #[tokio::test]
    async fn test_enqueue_quota() -> SchedulingResult<()> {
        let q = queue(2);
        let accepted = AtomicBool::new(false);
        q.enqueue_request("a", 1, 0, || accepted.store(true, Ordering::SeqCst))?;
        assert!(accepted.load(Ordering::SeqCst));
        q.enqueue_request("a", 2, 0, || {})?;

        let accepted = AtomicBool::new(false);
        let result = q.enqueue_request("a", 3, 0, || accepted.store(true, Ordering::SeqCst));
        assert!(matches!(result, Err(SchedulingError::TooManyRequests)));
        assert!(!accepted.load(Ordering::SeqCst));
        assert_eq!(q.len(), 2);

        // Other tenants have their own quota.
        q.enqueue_request("b", 4, 0, || {})?;
        assert_eq!(q.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_enqueue_zero_quota_has_no_side_effect() {
        let q = queue(0);
        let result = q.enqueue_request("a", 1, 0, || {});
        assert!(matches!(result, Err(SchedulingError::TooManyRequests)));
        assert_eq!(q.tenant_count(), 0);
    }

    #[tokio::test]
    async fn test_round_robin_across_tenants() -> SchedulingResult<()> {
        let q = queue(10);
        q.register_querier_connection("querier-1")?;
        for (tenant, request) in [("a", 1), ("a", 2), ("b", 3), ("b", 4), ("c", 5)] {
            q.enqueue_request(tenant, request, 0, || {})?;
        }
        let ctx = CancellationToken::new();
        let mut last = TenantIndex::first();
        let mut received = vec![];
        for _ in 0..5 {
            let (request, index) = q.get_next_request_for_querier(&ctx, last, "querier-1").await?;
            received.push(request);
            last = index;
        }
        assert_eq!(received, vec![1, 3, 5, 2, 4]);
        assert!(q.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() -> SchedulingResult<()> {
        let q = queue(10);
        q.register_querier_connection("querier-1")?;
        let handle = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                let ctx = CancellationToken::new();
                q.get_next_request_for_querier(&ctx, TenantIndex::first(), "querier-1")
                    .await
                    .map(|(request, _)| request)
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        q.enqueue_request("a", 42, 0, || {})?;
        let request = handle.await??;
        assert_eq!(request, 42);
        Ok(())
    }

    #[tokio::test]
    async fn test_dequeue_cancelled() {
        let q = queue(10);
        let ctx = CancellationToken::new();
        let handle = {
            let q = Arc::clone(&q);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                q.get_next_request_for_querier(&ctx, TenantIndex::first(), "querier-1")
                    .await
            })
        };
        ctx.cancel();
        let result = handle.await;
        assert!(matches!(result, Ok(Err(SchedulingError::Cancelled(_)))));
    }

    #[tokio::test]
    async fn test_stop_waits_for_drain() -> SchedulingResult<()> {
        let q = queue(10);
        q.register_querier_connection("querier-1")?;
        q.enqueue_request("a", 1, 0, || {})?;

        let stop = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!q.is_stopped());

        let ctx = CancellationToken::new();
        let (request, last) = q
            .get_next_request_for_querier(&ctx, TenantIndex::first(), "querier-1")
            .await?;
        assert_eq!(request, 1);
        stop.await??;
        assert!(q.is_stopped());

        let result = q.get_next_request_for_querier(&ctx, last, "querier-1").await;
        assert!(matches!(result, Err(SchedulingError::QueueStopped)));
        let result = q.enqueue_request("a", 2, 0, || {});
        assert!(matches!(result, Err(SchedulingError::QueueStopped)));
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_without_queriers() -> SchedulingResult<()> {
        let q = queue(10);
        q.enqueue_request("a", 1, 0, || {})?;
        q.stop().await?;
        assert!(q.is_stopped());
        assert_eq!(q.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_unblocks_waiting_querier() -> SchedulingResult<()> {
        let q = queue(10);
        q.register_querier_connection("querier-1")?;
        let handle = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                let ctx = CancellationToken::new();
                q.get_next_request_for_querier(&ctx, TenantIndex::first(), "querier-1")
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        q.stop().await?;
        let result = handle.await?;
        assert!(matches!(result, Err(SchedulingError::QueueStopped)));
        Ok(())
    }
}
