use std::sync::Arc;
use std::time::{Duration, Instant};

use ferry_server::{Backoff, BackoffConfig};
use ferry_telemetry::common::SpanAttribute;
use ferry_telemetry::futures::RecordedFutureExt;
use ferry_telemetry::recorder::{record_error, record_status_code};
use ferry_telemetry::trace::{root_span_with_parent, span_context_from_headers};
use futures::StreamExt;
use log::{debug, error, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::{Code, Streaming};

use crate::error::{SchedulingError, SchedulingResult, SCHEDULER_NOT_RUNNING_MESSAGE};
use crate::proto::frontend::{QueryResultRequest, QueryStats};
use crate::proto::http::{HttpRequest, HttpResponse};
use crate::proto::scheduler::{
    NotifyQuerierShutdownRequest, QuerierToScheduler, SchedulerForQuerierClient,
    SchedulerToQuerier,
};
use crate::rpc::{request_with_org_id, CLIENT_MAX_MESSAGE_SIZE};
use crate::worker::frontend_pool::FrontendPool;

const HTTP_INTERNAL_SERVER_ERROR: i32 = 500;
const HTTP_PAYLOAD_TOO_LARGE: i32 = 413;
const NOTIFY_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs queries received from one broker connection.
#[tonic::async_trait]
pub trait Processor: Send + Sync {
    /// Processes queries until the token is cancelled.
    async fn process_queries_on_single_stream(
        &self,
        ctx: CancellationToken,
        channel: Channel,
        address: &str,
    );

    /// Tells the broker that this querier is shutting down.
    async fn notify_shutdown(&self, channel: Channel, address: &str);
}

/// The request information that is not part of the HTTP request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tenant_id: String,
    pub query_id: u64,
    pub stats_enabled: bool,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    /// A failure that already has a response for the frontend.
    #[error("request failed with status {}", .0.code)]
    Response(HttpResponse),
    #[error("{0}")]
    Internal(String),
}

/// Executes the HTTP requests dispatched to the querier.
#[tonic::async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &RequestContext,
        request: HttpRequest,
    ) -> Result<HttpResponse, HandlerError>;
}

#[derive(Debug, Clone)]
pub struct SchedulerProcessorOptions {
    pub querier_id: String,
    pub max_send_message_size: usize,
    pub backoff: BackoffConfig,
}

/// A processor that pulls queries from a scheduler through the querier loop.
pub struct SchedulerProcessor {
    options: SchedulerProcessorOptions,
    handler: Arc<dyn RequestHandler>,
    frontend_pool: Arc<FrontendPool>,
}

impl SchedulerProcessor {
    pub fn new(
        options: SchedulerProcessorOptions,
        handler: Arc<dyn RequestHandler>,
        frontend_pool: Arc<FrontendPool>,
    ) -> Self {
        Self {
            options,
            handler,
            frontend_pool,
        }
    }

    fn client(channel: Channel) -> SchedulerForQuerierClient<Channel> {
        SchedulerForQuerierClient::new(channel)
            .max_decoding_message_size(CLIENT_MAX_MESSAGE_SIZE)
            .max_encoding_message_size(CLIENT_MAX_MESSAGE_SIZE)
    }

    /// Runs one querier loop until the stream ends or the token is cancelled.
    async fn querier_loop(
        &self,
        client: &mut SchedulerForQuerierClient<Channel>,
        ctx: &CancellationToken,
        address: &str,
        backoff: &mut Backoff,
    ) -> SchedulingResult<()> {
        let (tx, rx) = mpsc::channel(1);
        tx.send(QuerierToScheduler {
            querier_id: self.options.querier_id.clone(),
        })
        .await
        .map_err(|_| SchedulingError::internal("querier stream closed"))?;
        let response = tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            response = client.querier_loop(ReceiverStream::new(rx)) => response?,
        };
        let mut stream = response.into_inner();
        debug!("querier loop connected to scheduler {address}");

        loop {
            let message = tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                message = stream.message() => message?,
            };
            let Some(request) = message else {
                return Err(SchedulingError::internal("stream terminated"));
            };
            backoff.reset();
            self.process_request(&mut stream, request).await?;
            // The acknowledgement lets the scheduler dispatch the next request.
            tx.send(QuerierToScheduler::default())
                .await
                .map_err(|_| SchedulingError::internal("querier stream closed"))?;
        }
    }

    /// Runs the request while watching the stream.
    /// The scheduler closes the stream to cancel the request.
    async fn process_request(
        &self,
        stream: &mut Streaming<SchedulerToQuerier>,
        request: SchedulerToQuerier,
    ) -> SchedulingResult<()> {
        let query_id = request.query_id;
        tokio::select! {
            _ = self.run_request(request) => Ok(()),
            message = stream.next() => {
                debug!("query {query_id} cancelled by the scheduler");
                match message {
                    Some(Ok(_)) => Err(SchedulingError::invalid(
                        "received a request before acknowledging the previous one",
                    )),
                    Some(Err(status)) => Err(status.into()),
                    None => Err(SchedulingError::cancelled("stream terminated")),
                }
            }
        }
    }

    async fn run_request(&self, request: SchedulerToQuerier) {
        let SchedulerToQuerier {
            query_id,
            http_request,
            frontend_address,
            tenant_id,
            stats_enabled,
        } = request;
        let http_request = http_request.unwrap_or_default();
        let parent = span_context_from_headers(http_request.header_values());
        let span = root_span_with_parent("querier.run_request", parent).with_properties(|| {
            [
                (SpanAttribute::QUERIER_ID, self.options.querier_id.clone()),
                (SpanAttribute::TENANT_ID, tenant_id.clone()),
                (SpanAttribute::QUERY_ID, query_id.to_string()),
                (SpanAttribute::FRONTEND_ADDRESS, frontend_address.clone()),
                (SpanAttribute::HTTP_METHOD, http_request.method.clone()),
                (SpanAttribute::HTTP_URL, http_request.url.clone()),
            ]
        });
        let ctx = RequestContext {
            tenant_id,
            query_id,
            stats_enabled,
        };

        let start = Instant::now();
        let result = self
            .handler
            .handle(&ctx, http_request)
            .in_span_with_recorder(span, |span, result| {
                record_error(span, result);
                if let Ok(response) = result {
                    record_status_code(span, response.code);
                }
            })
            .await;
        let wall_time = start.elapsed();
        let response = self.build_response(result);
        let stats = stats_enabled.then(|| QueryStats {
            wall_time_nanos: u64::try_from(wall_time.as_nanos()).unwrap_or(u64::MAX),
        });

        let message = QueryResultRequest {
            query_id,
            http_response: Some(response),
            stats,
        };
        if let Err(e) = self
            .send_result(&frontend_address, &ctx.tenant_id, message)
            .await
        {
            warn!("failed to send the result of query {query_id} to frontend {frontend_address}: {e}");
        }
    }

    fn build_response(&self, result: Result<HttpResponse, HandlerError>) -> HttpResponse {
        let response = match result {
            Ok(response) => response,
            Err(HandlerError::Response(response)) => response,
            Err(e @ HandlerError::Internal(_)) => {
                HttpResponse::with_text(HTTP_INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        let max = self.options.max_send_message_size;
        if response.body.len() > max {
            let size = response.body.len();
            let message =
                format!("response larger than the max message size ({size} vs {max})");
            return HttpResponse::with_text(HTTP_PAYLOAD_TOO_LARGE, message);
        }
        response
    }

    async fn send_result(
        &self,
        frontend_address: &str,
        tenant_id: &str,
        message: QueryResultRequest,
    ) -> SchedulingResult<()> {
        let mut client = self.frontend_pool.get_client(frontend_address).await?;
        client
            .query
            .query_result(request_with_org_id(message, tenant_id)?)
            .await?;
        Ok(())
    }
}

/// How the processor reacts to a failed querier loop.
#[derive(Debug, PartialEq, Eq)]
enum LoopFailure {
    /// The scheduler is shutting down and another instance should take over.
    NotRunning,
    /// The stream deadline elapsed.
    DeadlineExceeded,
    /// The stream was closed by a cancellation, which happens routinely.
    Terminated,
    Unexpected,
}

fn classify_loop_failure(error: &SchedulingError) -> LoopFailure {
    match error {
        SchedulingError::TonicStatusError(status) => match status.code() {
            Code::Unavailable if status.message() == SCHEDULER_NOT_RUNNING_MESSAGE => {
                LoopFailure::NotRunning
            }
            Code::DeadlineExceeded => LoopFailure::DeadlineExceeded,
            Code::Cancelled => LoopFailure::Terminated,
            _ if status.message().contains("stream terminated") => LoopFailure::Terminated,
            _ => LoopFailure::Unexpected,
        },
        SchedulingError::Cancelled(_) => LoopFailure::Terminated,
        e if e.to_string().contains("stream terminated") => LoopFailure::Terminated,
        _ => LoopFailure::Unexpected,
    }
}

#[tonic::async_trait]
impl Processor for SchedulerProcessor {
    async fn process_queries_on_single_stream(
        &self,
        ctx: CancellationToken,
        channel: Channel,
        address: &str,
    ) {
        let mut client = Self::client(channel);
        let mut backoff = Backoff::new(self.options.backoff.clone());
        while !ctx.is_cancelled() && backoff.ongoing() {
            let Err(e) = self
                .querier_loop(&mut client, &ctx, address, &mut backoff)
                .await
            else {
                continue;
            };
            match classify_loop_failure(&e) {
                LoopFailure::DeadlineExceeded => {
                    backoff.reset();
                    continue;
                }
                LoopFailure::Terminated => {
                    // The scheduler closes the stream to cancel an in-flight request.
                    debug!("querier loop with {address} terminated: {e}");
                    backoff.reset();
                    continue;
                }
                LoopFailure::NotRunning => {
                    // Retry soon, but not in a tight loop while the scheduler drains.
                    debug!("scheduler {address} is not running");
                    backoff.reset();
                }
                LoopFailure::Unexpected => error!("error processing requests from {address}: {e}"),
            }
            if !backoff.wait(&ctx).await {
                break;
            }
        }
        debug!("processor for scheduler {address} stopped");
    }

    async fn notify_shutdown(&self, channel: Channel, address: &str) {
        let mut client = Self::client(channel);
        let request = NotifyQuerierShutdownRequest {
            querier_id: self.options.querier_id.clone(),
        };
        match tokio::time::timeout(NOTIFY_SHUTDOWN_TIMEOUT, client.notify_querier_shutdown(request))
            .await
        {
            Ok(Ok(_)) => debug!("notified scheduler {address} about querier shutdown"),
            Ok(Err(status)) => {
                warn!("failed to notify scheduler {address} about querier shutdown: {status}")
            }
            Err(_) => warn!("timed out notifying scheduler {address} about querier shutdown"),
        }
    }
}
