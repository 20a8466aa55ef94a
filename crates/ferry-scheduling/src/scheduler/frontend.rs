use std::sync::{Arc, Mutex};
use std::time::Instant;

use ferry_server::ServiceState;
use ferry_telemetry::common::SpanAttribute;
use ferry_telemetry::trace::{root_span_with_parent, span_context_from_headers};
use futures::Stream;
use log::{debug, error};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::error::{SchedulingError, SchedulingResult};
use crate::proto::scheduler::{
    FrontendToScheduler, FrontendToSchedulerType, SchedulerToFrontend, SchedulerToFrontendStatus,
};
use crate::scheduler::{recv, send, FrontendConnection, RequestKey, Scheduler, SchedulerRequest};
use crate::tenant::{smallest_positive_non_zero_per_tenant, tenant_ids_from_org_id};

impl Scheduler {
    /// Serves one frontend stream.
    ///
    /// The first message must be `Init` with the frontend address. The loop then handles
    /// `Enqueue` and `Cancel` messages while the scheduler is running, and finally sends
    /// `ShuttingDown` so that the frontend can retry with another scheduler.
    pub async fn frontend_loop<S>(
        &self,
        mut stream: S,
        tx: &mpsc::Sender<Result<SchedulerToFrontend, Status>>,
        ctx: &CancellationToken,
    ) -> SchedulingResult<()>
    where
        S: Stream<Item = Result<FrontendToScheduler, Status>> + Unpin + Send,
    {
        let Some(init) = recv(&mut stream, ctx).await? else {
            return Err(SchedulingError::invalid(
                "frontend stream closed before the init message",
            ));
        };
        if !matches!(
            FrontendToSchedulerType::try_from(init.r#type),
            Ok(FrontendToSchedulerType::Init)
        ) || init.frontend_address.is_empty()
        {
            return Err(SchedulingError::invalid("no frontend address"));
        }
        let address = init.frontend_address;
        let frontend_token = self.frontend_connected(&address)?;
        let _connection = FrontendConnection {
            scheduler: self,
            address: address.clone(),
        };
        debug!("frontend {address} connected");

        // The init message is only acknowledged by a running scheduler.
        if self.state.get() == ServiceState::Running {
            send(tx, SchedulerToFrontend::with_status(SchedulerToFrontendStatus::Ok)).await?;
        }

        while self.state.get() == ServiceState::Running {
            let message = tokio::select! {
                message = recv(&mut stream, ctx) => message?,
                _ = self.state.wait_for(|s| s != ServiceState::Running) => break,
            };
            let Some(message) = message else {
                break;
            };
            let response = match FrontendToSchedulerType::try_from(message.r#type) {
                Ok(FrontendToSchedulerType::Enqueue) => {
                    match self.enqueue_request(&frontend_token, &address, message) {
                        Ok(()) => SchedulerToFrontend::with_status(SchedulerToFrontendStatus::Ok),
                        Err(SchedulingError::TooManyRequests) => SchedulerToFrontend::with_status(
                            SchedulerToFrontendStatus::TooManyRequestsPerTenant,
                        ),
                        Err(e) => SchedulerToFrontend::with_error(e.to_string()),
                    }
                }
                Ok(FrontendToSchedulerType::Cancel) => {
                    self.cancel_request_and_remove_from_pending(&address, message.query_id)?;
                    SchedulerToFrontend::with_status(SchedulerToFrontendStatus::Ok)
                }
                _ => {
                    error!(
                        "unknown request type from frontend {address}: {}",
                        message.r#type
                    );
                    return Err(SchedulingError::invalid("unknown request type"));
                }
            };
            send(tx, response).await?;
        }

        // Best effort, the frontend may have closed the stream already.
        let _ = send(
            tx,
            SchedulerToFrontend::with_status(SchedulerToFrontendStatus::ShuttingDown),
        )
        .await;
        debug!("frontend {address} loop finished");
        Ok(())
    }

    fn enqueue_request(
        &self,
        frontend_token: &CancellationToken,
        frontend_address: &str,
        message: FrontendToScheduler,
    ) -> SchedulingResult<()> {
        let FrontendToScheduler {
            query_id,
            tenant_id,
            http_request,
            stats_enabled,
            ..
        } = message;
        let http_request = http_request.unwrap_or_default();
        let parent = span_context_from_headers(http_request.header_values());
        let tenant_ids = tenant_ids_from_org_id(&tenant_id)?;
        let max_queriers = smallest_positive_non_zero_per_tenant(&tenant_ids, |tenant| {
            self.options.limits.max_queriers_per_tenant(tenant)
        });

        let request = Arc::new(SchedulerRequest {
            frontend_address: frontend_address.to_string(),
            tenant_id: tenant_id.clone(),
            query_id,
            http_request,
            stats_enabled,
            enqueue_time: Instant::now(),
            token: frontend_token.child_token(),
            queue_span: Mutex::new(Some(root_span_with_parent("scheduler.queued", parent).with_properties(
                || {
                    [
                        (SpanAttribute::TENANT_ID, tenant_id.clone()),
                        (SpanAttribute::QUERY_ID, query_id.to_string()),
                        (SpanAttribute::FRONTEND_ADDRESS, frontend_address.to_string()),
                    ]
                },
            ))),
        });
        let key = RequestKey::new(frontend_address, query_id);
        let result = self.queue.enqueue_request(
            &tenant_id,
            Arc::clone(&request),
            max_queriers,
            || {
                if let Ok(mut pending) = self.pending_requests.lock() {
                    if let Some(previous) = pending.insert(key, Arc::clone(&request)) {
                        // At most one live request per key.
                        previous.token.cancel();
                    }
                }
            },
        );
        if result.is_err() {
            request.token.cancel();
        }
        result
    }
}
