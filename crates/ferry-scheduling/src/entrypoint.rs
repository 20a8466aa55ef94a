use std::sync::Arc;
use std::time::Duration;

use ferry_common::config::{AppConfig, ServiceDiscoveryMode};
use ferry_server::{BackoffConfig, ServerBuilder, ServerBuilderOptions};
use ferry_telemetry::metrics::MetricRegistry;
use log::{error, info};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::discovery::{DnsServiceDiscovery, InMemoryRing, Ring, RingServiceDiscovery};
use crate::proto::scheduler::{SchedulerForFrontendServer, SchedulerForQuerierServer};
use crate::rpc::CLIENT_MAX_MESSAGE_SIZE;
use crate::scheduler::{Scheduler, SchedulerOptions, SchedulerServer};
use crate::worker::{
    querier_id, FrontendPool, FrontendPoolOptions, QuerierWorker, RequestHandler,
    SchedulerProcessor, SchedulerProcessorOptions,
};

/// Cancels the returned token on `SIGINT`.
fn shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let signal = token.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down...");
        signal.cancel();
    });
    token
}

/// A ring that only lives in this process, used when no external membership store is wired.
fn local_ring(config: &AppConfig) -> Option<Arc<dyn Ring>> {
    match config.service_discovery.mode {
        ServiceDiscoveryMode::Ring => Some(Arc::new(InMemoryRing::new(Duration::from_secs(
            config.service_discovery.ring_heartbeat_timeout_secs,
        )))),
        ServiceDiscoveryMode::Dns => None,
    }
}

pub async fn run_scheduler(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    serve_scheduler(config, local_ring(config), shutdown_signal()).await
}

pub async fn run_querier(
    config: &AppConfig,
    handler: Arc<dyn RequestHandler>,
) -> Result<(), Box<dyn std::error::Error>> {
    run_worker(config, handler, local_ring(config), shutdown_signal()).await
}

/// Runs a scheduler and a querier in one process.
/// In ring mode both share the same in-process ring.
pub async fn run_standalone(
    config: &AppConfig,
    handler: Arc<dyn RequestHandler>,
) -> Result<(), Box<dyn std::error::Error>> {
    let ring = local_ring(config);
    let token = shutdown_signal();
    let (scheduler, querier) = tokio::join!(
        serve_scheduler(config, ring.clone(), token.clone()),
        run_worker(config, handler, ring, token)
    );
    scheduler?;
    querier?;
    Ok(())
}

async fn serve_scheduler(
    config: &AppConfig,
    ring: Option<Arc<dyn Ring>>,
    token: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = SchedulerOptions::new(config, ring);
    let scheduler = Arc::new(Scheduler::new(options, Arc::new(MetricRegistry::global())));
    scheduler.start().await?;

    let listener = TcpListener::bind((
        config.scheduler.listen_host.as_str(),
        config.scheduler.listen_port,
    ))
    .await?;
    let server = SchedulerServer::new(Arc::clone(&scheduler));
    let builder = ServerBuilder::new("ferry-scheduler", ServerBuilderOptions::default())
        .add_service(
            SchedulerForFrontendServer::new(server.clone())
                .max_decoding_message_size(CLIENT_MAX_MESSAGE_SIZE)
                .max_encoding_message_size(CLIENT_MAX_MESSAGE_SIZE),
        )
        .await
        .add_service(
            SchedulerForQuerierServer::new(server)
                .max_decoding_message_size(CLIENT_MAX_MESSAGE_SIZE)
                .max_encoding_message_size(CLIENT_MAX_MESSAGE_SIZE),
        )
        .await;
    let mut health = builder.health_reporter();

    // The scheduler is stopped before the server so that the open loops can end gracefully.
    let signal = async {
        token.cancelled().await;
        health
            .set_not_serving::<SchedulerForQuerierServer<SchedulerServer>>()
            .await;
        if let Err(e) = scheduler.stop().await {
            error!("failed to stop the scheduler: {e}");
        }
    };
    builder.serve(listener, signal).await?;
    info!("the scheduler has stopped");
    Ok(())
}

async fn run_worker(
    config: &AppConfig,
    handler: Arc<dyn RequestHandler>,
    ring: Option<Arc<dyn Ring>>,
    token: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate_querier()?;
    let metrics = Arc::new(MetricRegistry::global());
    let pool = Arc::new(FrontendPool::new(
        FrontendPoolOptions::new(&config.frontend_pool),
        metrics,
    ));
    let options = SchedulerProcessorOptions {
        querier_id: querier_id(&config.querier.id),
        max_send_message_size: config.querier.max_send_message_size,
        backoff: BackoffConfig::default(),
    };
    info!("starting querier {}", options.querier_id);
    let processor = Arc::new(SchedulerProcessor::new(options, handler, Arc::clone(&pool)));
    let worker = Arc::new(QuerierWorker::new(
        processor,
        config.querier.max_concurrent_requests,
    ));

    let tasks = TaskTracker::new();
    let background = CancellationToken::new();
    {
        let pool = Arc::clone(&pool);
        let token = background.clone();
        tasks.spawn(async move { pool.run_health_checks(token).await });
    }
    match ring {
        Some(ring) => {
            let discovery = RingServiceDiscovery::new(
                ring,
                config.service_discovery.max_used_instances(),
                Duration::from_secs(config.service_discovery.ring_check_period_secs),
                worker.clone(),
            );
            tasks.spawn(discovery.run(background.clone()));
        }
        None => {
            let discovery = DnsServiceDiscovery::new(
                config.querier.scheduler_address.clone(),
                Duration::from_secs(config.querier.dns_lookup_period_secs),
                worker.clone(),
            );
            tasks.spawn(discovery.run(background.clone()));
        }
    }

    token.cancelled().await;
    // The worker ignores instance notifications once stopped.
    worker.stop().await?;
    background.cancel();
    tasks.close();
    tasks.wait().await;
    info!("the querier has stopped");
    Ok(())
}
