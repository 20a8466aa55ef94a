use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ferry_scheduling::discovery::{Instance, Notifications};
use ferry_scheduling::proto::frontend::{
    FrontendForQuerier, FrontendForQuerierServer, QueryResultRequest, QueryResultResponse,
};
use ferry_scheduling::proto::http::{HttpRequest, HttpResponse};
use ferry_scheduling::proto::scheduler::{
    FrontendToScheduler, FrontendToSchedulerType, QuerierToScheduler, SchedulerForFrontendClient,
    SchedulerForFrontendServer, SchedulerForQuerierClient, SchedulerForQuerierServer,
    SchedulerToFrontend, SchedulerToFrontendStatus, SchedulerToQuerier,
};
use ferry_scheduling::scheduler::{SchedulerOptions, SchedulerServer};
use ferry_scheduling::tenant::ORG_ID_HEADER;
use ferry_scheduling::worker::{
    FrontendPool, FrontendPoolOptions, HandlerError, QuerierWorker, RequestContext,
    RequestHandler, SchedulerProcessor, SchedulerProcessorOptions,
};
use ferry_scheduling::Scheduler;
use ferry_server::BackoffConfig;
use ferry_telemetry::metrics::MetricRegistry;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::TcpIncoming;
use tonic::transport::Server;
use tonic::{Code, Request, Response, Status, Streaming};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const POLL_TIMEOUT: Duration = Duration::from_secs(5);
const NO_RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

/// Waits until the condition holds, or fails the test after a deadline.
async fn poll<F>(condition: F)
where
    F: Fn() -> bool,
{
    let result = tokio::time::timeout(POLL_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not met before the deadline");
}

/// Checks that nothing arrives on the stream for a while.
async fn verify_no_receive<T: Send + 'static>(stream: &mut Streaming<T>) {
    let result = tokio::time::timeout(NO_RECEIVE_TIMEOUT, stream.message()).await;
    assert!(result.is_err(), "unexpected message on the stream");
}

async fn bind() -> Result<(TcpIncoming, String), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?.to_string();
    let incoming = TcpIncoming::from_listener(listener, true, None)
        .map_err(|e| e as Box<dyn std::error::Error>)?;
    Ok((incoming, address))
}

struct TestScheduler {
    scheduler: Arc<Scheduler>,
    address: String,
    shutdown: CancellationToken,
}

impl TestScheduler {
    async fn start(options: SchedulerOptions) -> Result<Self, Box<dyn std::error::Error>> {
        let scheduler = Arc::new(Scheduler::new(options, Arc::new(MetricRegistry::global())));
        scheduler.start().await?;
        let (incoming, address) = bind().await?;
        let server = SchedulerServer::new(Arc::clone(&scheduler));
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            let _ = Server::builder()
                .add_service(SchedulerForFrontendServer::new(server.clone()))
                .add_service(SchedulerForQuerierServer::new(server))
                .serve_with_incoming_shutdown(incoming, signal.cancelled_owned())
                .await;
        });
        Ok(Self {
            scheduler,
            address,
            shutdown,
        })
    }

    fn url(&self) -> String {
        format!("http://{}", self.address)
    }

    async fn frontend(&self, frontend_address: &str) -> Result<TestFrontend, Box<dyn std::error::Error>> {
        let mut client = SchedulerForFrontendClient::connect(self.url()).await?;
        let (tx, rx) = mpsc::channel(16);
        tx.send(FrontendToScheduler {
            r#type: FrontendToSchedulerType::Init as i32,
            frontend_address: frontend_address.to_string(),
            ..Default::default()
        })
        .await?;
        let mut stream = client.frontend_loop(ReceiverStream::new(rx)).await?.into_inner();
        let response = stream.message().await?;
        assert_eq!(status(&response), Some(SchedulerToFrontendStatus::Ok));
        Ok(TestFrontend { tx, stream })
    }

    async fn querier(&self, querier_id: &str) -> Result<TestQuerier, Box<dyn std::error::Error>> {
        let mut client = SchedulerForQuerierClient::connect(self.url()).await?;
        let (tx, rx) = mpsc::channel(16);
        tx.send(QuerierToScheduler {
            querier_id: querier_id.to_string(),
        })
        .await?;
        let stream = client.querier_loop(ReceiverStream::new(rx)).await?.into_inner();
        Ok(TestQuerier { tx, stream })
    }
}

impl Drop for TestScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct TestFrontend {
    tx: mpsc::Sender<FrontendToScheduler>,
    stream: Streaming<SchedulerToFrontend>,
}

impl TestFrontend {
    async fn send(
        &mut self,
        message: FrontendToScheduler,
    ) -> Result<Option<SchedulerToFrontendStatus>, Box<dyn std::error::Error>> {
        self.tx.send(message).await?;
        let response = self.stream.message().await?;
        Ok(status(&response))
    }

    async fn enqueue(
        &mut self,
        query_id: u64,
        tenant_id: &str,
    ) -> Result<Option<SchedulerToFrontendStatus>, Box<dyn std::error::Error>> {
        self.send(FrontendToScheduler {
            r#type: FrontendToSchedulerType::Enqueue as i32,
            query_id,
            tenant_id: tenant_id.to_string(),
            http_request: Some(hello_request()),
            ..Default::default()
        })
        .await
    }

    async fn cancel(
        &mut self,
        query_id: u64,
    ) -> Result<Option<SchedulerToFrontendStatus>, Box<dyn std::error::Error>> {
        self.send(FrontendToScheduler {
            r#type: FrontendToSchedulerType::Cancel as i32,
            query_id,
            ..Default::default()
        })
        .await
    }
}

struct TestQuerier {
    tx: mpsc::Sender<QuerierToScheduler>,
    stream: Streaming<SchedulerToQuerier>,
}

fn status(response: &Option<SchedulerToFrontend>) -> Option<SchedulerToFrontendStatus> {
    response
        .as_ref()
        .and_then(|r| SchedulerToFrontendStatus::try_from(r.status).ok())
}

fn hello_request() -> HttpRequest {
    HttpRequest {
        method: "GET".to_string(),
        url: "/hello".to_string(),
        headers: vec![],
        body: vec![],
    }
}

/// A frontend result service that records the results it receives with their tenant.
#[derive(Clone, Default)]
struct MockFrontend {
    results: Arc<Mutex<Vec<(String, QueryResultRequest)>>>,
}

impl MockFrontend {
    async fn start(&self) -> Result<(String, CancellationToken), Box<dyn std::error::Error>> {
        let (incoming, address) = bind().await?;
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let service = FrontendForQuerierServer::new(self.clone());
        tokio::spawn(async move {
            let _ = Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(incoming, signal.cancelled_owned())
                .await;
        });
        Ok((address, shutdown))
    }

    fn results(&self) -> Vec<(String, QueryResultRequest)> {
        self.results.lock().map(|x| x.clone()).unwrap_or_default()
    }
}

#[tonic::async_trait]
impl FrontendForQuerier for MockFrontend {
    async fn query_result(
        &self,
        request: Request<QueryResultRequest>,
    ) -> Result<Response<QueryResultResponse>, Status> {
        let tenant = request
            .metadata()
            .get(ORG_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if let Ok(mut results) = self.results.lock() {
            results.push((tenant, request.into_inner()));
        }
        Ok(Response::new(QueryResultResponse {}))
    }
}

struct EchoHandler;

#[tonic::async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(
        &self,
        ctx: &RequestContext,
        request: HttpRequest,
    ) -> Result<HttpResponse, HandlerError> {
        Ok(HttpResponse::with_text(
            200,
            format!("{} {} for {}", request.method, request.url, ctx.tenant_id),
        ))
    }
}

/// Blocks on query 1 and echoes every other query, recording the queries it starts.
#[derive(Clone, Default)]
struct BlockingHandler {
    started: Arc<Mutex<Vec<u64>>>,
}

impl BlockingHandler {
    fn started(&self) -> Vec<u64> {
        self.started.lock().map(|x| x.clone()).unwrap_or_default()
    }
}

#[tonic::async_trait]
impl RequestHandler for BlockingHandler {
    async fn handle(
        &self,
        ctx: &RequestContext,
        request: HttpRequest,
    ) -> Result<HttpResponse, HandlerError> {
        if let Ok(mut started) = self.started.lock() {
            started.push(ctx.query_id);
        }
        if ctx.query_id == 1 {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        EchoHandler.handle(ctx, request).await
    }
}

fn frontend_pool() -> Arc<FrontendPool> {
    Arc::new(FrontendPool::new(
        FrontendPoolOptions {
            check_interval: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(1),
            client_timeout: Duration::from_secs(5),
        },
        Arc::new(MetricRegistry::global()),
    ))
}

#[tokio::test]
async fn test_scheduler_dispatches_request_to_querier() -> TestResult {
    let test = TestScheduler::start(SchedulerOptions::default()).await?;
    let mut frontend = test.frontend("frontend-1:9096").await?;
    assert_eq!(
        frontend.enqueue(1, "test").await?,
        Some(SchedulerToFrontendStatus::Ok)
    );
    assert_eq!(test.scheduler.pending_request_count(), 1);

    let mut querier = test.querier("querier-1").await?;
    let Some(request) = querier.stream.message().await? else {
        panic!("querier stream closed");
    };
    assert_eq!(request.query_id, 1);
    assert_eq!(request.tenant_id, "test");
    assert_eq!(request.frontend_address, "frontend-1:9096");
    assert_eq!(request.http_request, Some(hello_request()));

    querier.tx.send(QuerierToScheduler::default()).await?;
    poll(|| test.scheduler.pending_request_count() == 0).await;
    Ok(())
}

#[tokio::test]
async fn test_scheduler_cancelled_request_is_not_dispatched() -> TestResult {
    let test = TestScheduler::start(SchedulerOptions::default()).await?;
    let mut frontend = test.frontend("frontend-1:9096").await?;
    assert_eq!(
        frontend.enqueue(1, "test").await?,
        Some(SchedulerToFrontendStatus::Ok)
    );
    assert_eq!(frontend.cancel(1).await?, Some(SchedulerToFrontendStatus::Ok));
    assert_eq!(test.scheduler.pending_request_count(), 0);

    let mut querier = test.querier("querier-1").await?;
    verify_no_receive(&mut querier.stream).await;
    Ok(())
}

#[tokio::test]
async fn test_scheduler_cancel_closes_querier_stream_of_dispatched_request() -> TestResult {
    let test = TestScheduler::start(SchedulerOptions::default()).await?;
    let mut frontend = test.frontend("frontend-1:9096").await?;
    assert_eq!(
        frontend.enqueue(1, "test").await?,
        Some(SchedulerToFrontendStatus::Ok)
    );

    let mut querier = test.querier("querier-1").await?;
    let Some(request) = querier.stream.message().await? else {
        panic!("querier stream closed");
    };
    assert_eq!(request.query_id, 1);

    assert_eq!(frontend.cancel(1).await?, Some(SchedulerToFrontendStatus::Ok));
    let result = querier.stream.message().await;
    assert!(
        matches!(&result, Err(status) if status.code() == Code::Cancelled),
        "{result:?}"
    );
    poll(|| test.scheduler.pending_request_count() == 0).await;
    Ok(())
}

#[tokio::test]
async fn test_scheduler_frontend_disconnect_cancels_requests() -> TestResult {
    let test = TestScheduler::start(SchedulerOptions::default()).await?;
    let mut frontend = test.frontend("frontend-1:9096").await?;
    assert_eq!(
        frontend.enqueue(1, "test").await?,
        Some(SchedulerToFrontendStatus::Ok)
    );
    assert_eq!(test.scheduler.pending_request_count(), 1);

    drop(frontend);
    poll(|| test.scheduler.pending_request_count() == 0).await;
    poll(|| test.scheduler.connected_frontend_clients() == 0).await;

    let mut querier = test.querier("querier-1").await?;
    verify_no_receive(&mut querier.stream).await;
    Ok(())
}

#[tokio::test]
async fn test_scheduler_too_many_requests_per_tenant() -> TestResult {
    let options = SchedulerOptions {
        max_outstanding_requests_per_tenant: 1,
        ..Default::default()
    };
    let test = TestScheduler::start(options).await?;
    let mut frontend = test.frontend("frontend-1:9096").await?;
    assert_eq!(
        frontend.enqueue(1, "test").await?,
        Some(SchedulerToFrontendStatus::Ok)
    );
    assert_eq!(
        frontend.enqueue(2, "test").await?,
        Some(SchedulerToFrontendStatus::TooManyRequestsPerTenant)
    );
    assert_eq!(
        frontend.enqueue(3, "other").await?,
        Some(SchedulerToFrontendStatus::Ok)
    );
    assert_eq!(test.scheduler.pending_request_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_scheduler_rejects_frontend_without_address() -> TestResult {
    let test = TestScheduler::start(SchedulerOptions::default()).await?;
    let mut client = SchedulerForFrontendClient::connect(test.url()).await?;
    let (tx, rx) = mpsc::channel(1);
    tx.send(FrontendToScheduler {
        r#type: FrontendToSchedulerType::Init as i32,
        ..Default::default()
    })
    .await?;
    let mut stream = client.frontend_loop(ReceiverStream::new(rx)).await?.into_inner();
    let result = stream.message().await;
    assert!(matches!(result, Err(status) if status.code() == Code::InvalidArgument));
    Ok(())
}

#[tokio::test]
async fn test_scheduler_shutdown_ends_frontend_loop() -> TestResult {
    let test = TestScheduler::start(SchedulerOptions::default()).await?;
    let mut frontend = test.frontend("frontend-1:9096").await?;

    test.scheduler.stop().await?;
    let response = frontend.stream.message().await?;
    assert_eq!(
        status(&response),
        Some(SchedulerToFrontendStatus::ShuttingDown)
    );
    Ok(())
}

#[tokio::test]
async fn test_scheduler_shutdown_ends_querier_loop() -> TestResult {
    let test = TestScheduler::start(SchedulerOptions::default()).await?;
    let mut querier = test.querier("querier-1").await?;
    poll(|| test.scheduler.connected_querier_clients() == 1).await;

    test.scheduler.stop().await?;
    let result = querier.stream.message().await;
    assert!(
        matches!(
            &result,
            Err(status) if status.code() == Code::Unavailable
                && status.message() == ferry_scheduling::error::SCHEDULER_NOT_RUNNING_MESSAGE
        ),
        "{result:?}"
    );
    Ok(())
}

#[tokio::test]
async fn test_scheduler_forwards_querier_failure_to_frontend() -> TestResult {
    let mock = MockFrontend::default();
    let (frontend_address, _shutdown) = mock.start().await?;
    let test = TestScheduler::start(SchedulerOptions::default()).await?;
    let mut frontend = test.frontend(&frontend_address).await?;
    assert_eq!(
        frontend.enqueue(7, "test").await?,
        Some(SchedulerToFrontendStatus::Ok)
    );

    let TestQuerier { tx, mut stream } = test.querier("querier-1").await?;
    let Some(request) = stream.message().await? else {
        panic!("querier stream closed");
    };
    assert_eq!(request.query_id, 7);
    // Closing the querier side of the stream before acknowledging fails the request.
    drop(tx);

    poll(|| !mock.results().is_empty()).await;
    let results = mock.results();
    let (tenant, result) = &results[0];
    assert_eq!(tenant, "test");
    assert_eq!(result.query_id, 7);
    assert_eq!(result.http_response.as_ref().map(|r| r.code), Some(500));
    poll(|| test.scheduler.pending_request_count() == 0).await;
    Ok(())
}

#[tokio::test]
async fn test_querier_worker_processes_requests_end_to_end() -> TestResult {
    let mock = MockFrontend::default();
    let (frontend_address, _shutdown) = mock.start().await?;
    let test = TestScheduler::start(SchedulerOptions::default()).await?;

    let pool = frontend_pool();
    let processor = Arc::new(SchedulerProcessor::new(
        SchedulerProcessorOptions {
            querier_id: "querier-1".to_string(),
            max_send_message_size: 1024,
            backoff: BackoffConfig::default(),
        },
        Arc::new(EchoHandler),
        pool,
    ));
    let worker = QuerierWorker::new(processor, 2);
    worker
        .instance_added(Instance::new(test.address.clone(), true))
        .await;
    poll(|| test.scheduler.connected_querier_clients() == 2).await;

    let mut frontend = test.frontend(&frontend_address).await?;
    assert_eq!(
        frontend.enqueue(1, "test").await?,
        Some(SchedulerToFrontendStatus::Ok)
    );
    poll(|| !mock.results().is_empty()).await;
    let results = mock.results();
    let (tenant, result) = &results[0];
    assert_eq!(tenant, "test");
    assert_eq!(result.query_id, 1);
    let response = result.http_response.clone().unwrap_or_default();
    assert_eq!(response.code, 200);
    assert_eq!(response.body, b"GET /hello for test");
    poll(|| test.scheduler.pending_request_count() == 0).await;

    worker.stop().await?;
    poll(|| test.scheduler.connected_querier_clients() == 0).await;
    Ok(())
}

#[tokio::test]
async fn test_querier_resumes_right_after_in_flight_cancel() -> TestResult {
    let mock = MockFrontend::default();
    let (frontend_address, _shutdown) = mock.start().await?;
    let test = TestScheduler::start(SchedulerOptions::default()).await?;

    let handler = BlockingHandler::default();
    let processor = Arc::new(SchedulerProcessor::new(
        SchedulerProcessorOptions {
            querier_id: "querier-1".to_string(),
            max_send_message_size: 1024,
            // Any backoff wait after the cancellation would exceed the deadline below.
            backoff: BackoffConfig {
                min_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(2),
                max_retries: 0,
            },
        },
        Arc::new(handler.clone()),
        frontend_pool(),
    ));
    let worker = QuerierWorker::new(processor, 1);
    worker
        .instance_added(Instance::new(test.address.clone(), true))
        .await;
    poll(|| test.scheduler.connected_querier_clients() == 1).await;

    let mut frontend = test.frontend(&frontend_address).await?;
    assert_eq!(
        frontend.enqueue(1, "test").await?,
        Some(SchedulerToFrontendStatus::Ok)
    );
    poll(|| handler.started() == vec![1]).await;

    let cancelled_at = Instant::now();
    assert_eq!(frontend.cancel(1).await?, Some(SchedulerToFrontendStatus::Ok));
    assert_eq!(
        frontend.enqueue(2, "test").await?,
        Some(SchedulerToFrontendStatus::Ok)
    );
    poll(|| mock.results().iter().any(|(_, r)| r.query_id == 2)).await;
    let elapsed = cancelled_at.elapsed();
    assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
    assert!(mock.results().iter().all(|(_, r)| r.query_id != 1));
    poll(|| test.scheduler.pending_request_count() == 0).await;

    worker.stop().await?;
    Ok(())
}
