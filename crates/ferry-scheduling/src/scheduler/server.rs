use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use log::{debug, error};
use pin_project_lite::pin_project;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::{Request, Response, Status, Streaming};

use crate::error::SchedulingError;
use crate::proto::scheduler::{
    FrontendToScheduler, NotifyQuerierShutdownRequest, NotifyQuerierShutdownResponse,
    QuerierToScheduler, SchedulerForFrontend, SchedulerForQuerier, SchedulerToFrontend,
    SchedulerToQuerier,
};
use crate::scheduler::Scheduler;

const LOOP_CHANNEL_SIZE: usize = 16;

pin_project! {
    /// The response stream of a scheduler loop.
    /// Dropping the stream, which happens when the client goes away, cancels the loop.
    pub struct LoopStream<T> {
        #[pin]
        inner: ReceiverStream<Result<T, Status>>,
        _guard: DropGuard,
    }
}

impl<T> LoopStream<T> {
    pub fn new(rx: mpsc::Receiver<Result<T, Status>>, guard: DropGuard) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
            _guard: guard,
        }
    }
}

impl<T> Stream for LoopStream<T> {
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

#[derive(Clone)]
pub struct SchedulerServer {
    scheduler: Arc<Scheduler>,
}

impl SchedulerServer {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

#[tonic::async_trait]
impl SchedulerForFrontend for SchedulerServer {
    type FrontendLoopStream = LoopStream<SchedulerToFrontend>;

    async fn frontend_loop(
        &self,
        request: Request<Streaming<FrontendToScheduler>>,
    ) -> Result<Response<Self::FrontendLoopStream>, Status> {
        let stream = request.into_inner();
        let (tx, rx) = mpsc::channel(LOOP_CHANNEL_SIZE);
        let ctx = CancellationToken::new();
        let scheduler = Arc::clone(&self.scheduler);
        let token = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.frontend_loop(stream, &tx, &token).await {
                report_loop_error("frontend", e, &tx).await;
            }
        });
        Ok(Response::new(LoopStream::new(rx, ctx.drop_guard())))
    }
}

#[tonic::async_trait]
impl SchedulerForQuerier for SchedulerServer {
    type QuerierLoopStream = LoopStream<SchedulerToQuerier>;

    async fn querier_loop(
        &self,
        request: Request<Streaming<QuerierToScheduler>>,
    ) -> Result<Response<Self::QuerierLoopStream>, Status> {
        let stream = request.into_inner();
        let (tx, rx) = mpsc::channel(LOOP_CHANNEL_SIZE);
        let ctx = CancellationToken::new();
        let scheduler = Arc::clone(&self.scheduler);
        let token = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.querier_loop(stream, &tx, &token).await {
                report_loop_error("querier", e, &tx).await;
            }
        });
        Ok(Response::new(LoopStream::new(rx, ctx.drop_guard())))
    }

    async fn notify_querier_shutdown(
        &self,
        request: Request<NotifyQuerierShutdownRequest>,
    ) -> Result<Response<NotifyQuerierShutdownResponse>, Status> {
        let request = request.into_inner();
        debug!("{request:?}");
        self.scheduler
            .notify_querier_shutdown(&request.querier_id)?;
        let response = NotifyQuerierShutdownResponse {};
        debug!("{response:?}");
        Ok(Response::new(response))
    }
}

/// Ends the response stream with the status of the loop error.
async fn report_loop_error<T>(
    name: &str,
    error: SchedulingError,
    tx: &mpsc::Sender<Result<T, Status>>,
) {
    match &error {
        SchedulingError::SchedulerNotRunning | SchedulingError::Cancelled(_) => {
            debug!("{name} loop finished: {error}");
        }
        _ => error!("{name} loop failed: {error}"),
    }
    let _ = tx.send(Err(error.into())).await;
}
