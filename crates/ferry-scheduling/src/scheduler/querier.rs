use std::sync::atomic::Ordering;
use std::sync::Arc;

use ferry_server::ServiceState;
use ferry_telemetry::metrics::MetricAttribute;
use futures::{Stream, StreamExt};
use log::{debug, warn};
use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Status;

use crate::error::{SchedulingError, SchedulingResult};
use crate::proto::frontend::{FrontendForQuerierClient, QueryResultRequest};
use crate::proto::http::HttpResponse;
use crate::proto::scheduler::{QuerierToScheduler, SchedulerToQuerier};
use crate::queue::TenantIndex;
use crate::rpc::{request_with_org_id, ClientBuilder, ClientOptions};
use crate::scheduler::{recv, QuerierConnection, Scheduler, SchedulerRequest};

const HTTP_INTERNAL_SERVER_ERROR: i32 = 500;

impl Scheduler {
    /// Serves one querier stream.
    ///
    /// The first message carries the querier ID. Each dispatched request must be acknowledged
    /// by the querier before the next one is sent. The queue is still drained while
    /// the scheduler is stopping.
    pub async fn querier_loop<S>(
        &self,
        mut stream: S,
        tx: &mpsc::Sender<Result<SchedulerToQuerier, Status>>,
        ctx: &CancellationToken,
    ) -> SchedulingResult<()>
    where
        S: Stream<Item = Result<QuerierToScheduler, Status>> + Unpin + Send,
    {
        let Some(first) = recv(&mut stream, ctx).await? else {
            return Err(SchedulingError::invalid(
                "querier stream closed before sending the querier ID",
            ));
        };
        let querier_id = first.querier_id;
        self.queue.register_querier_connection(&querier_id)?;
        self.connected_querier_clients.fetch_add(1, Ordering::SeqCst);
        let _connection = QuerierConnection {
            scheduler: self,
            querier_id: querier_id.clone(),
        };
        debug!("querier {querier_id} connected");

        let mut last = TenantIndex::first();
        while matches!(
            self.state.get(),
            ServiceState::Running | ServiceState::Stopping
        ) {
            let (request, index) = match self
                .queue
                .get_next_request_for_querier(ctx, last, &querier_id)
                .await
            {
                Ok(x) => x,
                Err(SchedulingError::QueueStopped) if self.state.get() != ServiceState::Running => {
                    return Err(SchedulingError::SchedulerNotRunning);
                }
                Err(e) => return Err(e),
            };
            last = index;
            self.metrics
                .scheduler_queue_duration
                .record(request.enqueue_time.elapsed().as_secs_f64(), &[]);
            request.finish_queue_span();

            // Skip requests cancelled while in the queue and try the same tenant again,
            // so that a tenant with many cancelled requests is not starved.
            if request.token.is_cancelled() {
                self.metrics.scheduler_cancelled_requests.add(
                    1,
                    &[KeyValue::new(
                        MetricAttribute::TENANT,
                        request.tenant_id.clone(),
                    )],
                );
                self.complete_request(&request);
                last = last.reuse_last_tenant();
                continue;
            }

            self.forward_request_to_querier(&mut stream, tx, &request)
                .await?;
        }
        Err(SchedulingError::SchedulerNotRunning)
    }

    async fn forward_request_to_querier<S>(
        &self,
        stream: &mut S,
        tx: &mpsc::Sender<Result<SchedulerToQuerier, Status>>,
        request: &Arc<SchedulerRequest>,
    ) -> SchedulingResult<()>
    where
        S: Stream<Item = Result<QuerierToScheduler, Status>> + Unpin + Send,
    {
        let message = SchedulerToQuerier {
            query_id: request.query_id,
            http_request: Some(request.http_request.clone()),
            frontend_address: request.frontend_address.clone(),
            tenant_id: request.tenant_id.clone(),
            stats_enabled: request.stats_enabled,
        };
        let exchange = async {
            tx.send(Ok(message))
                .await
                .map_err(|_| SchedulingError::internal("querier stream closed"))?;
            match stream.next().await {
                Some(Ok(_)) => Ok(()),
                Some(Err(status)) => Err(SchedulingError::from(status)),
                None => Err(SchedulingError::internal("querier stream closed")),
            }
        };
        let result = tokio::select! {
            // Closing the stream is the only way to tell the querier to stop processing.
            _ = request.token.cancelled() => {
                Err(SchedulingError::cancelled("request cancelled"))
            }
            result = exchange => {
                if let Err(e) = &result {
                    self.forward_error_to_frontend(request, e).await;
                }
                result
            }
        };
        self.complete_request(request);
        result
    }

    /// Reports a transport error to the frontend waiting for the result. Failures are only logged.
    async fn forward_error_to_frontend(&self, request: &SchedulerRequest, error: &SchedulingError) {
        let options = ClientOptions {
            address: request.frontend_address.clone(),
            connect_timeout: Some(self.options.frontend_client_timeout),
            request_timeout: Some(self.options.frontend_client_timeout),
        };
        let result = async {
            let mut client =
                <FrontendForQuerierClient<Channel> as ClientBuilder>::connect(&options).await?;
            let message = QueryResultRequest {
                query_id: request.query_id,
                http_response: Some(HttpResponse::with_text(
                    HTTP_INTERNAL_SERVER_ERROR,
                    error.to_string(),
                )),
                stats: None,
            };
            client
                .query_result(request_with_org_id(message, &request.tenant_id)?)
                .await?;
            Ok::<_, SchedulingError>(())
        }
        .await;
        if let Err(e) = result {
            warn!(
                "failed to forward error to frontend {} for query {}: {e}",
                request.frontend_address, request.query_id
            );
        }
    }
}
