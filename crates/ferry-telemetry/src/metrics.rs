use std::fmt;

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter, UpDownCounter};

/// Metric attribute keys.
pub struct MetricAttribute;

impl MetricAttribute {
    pub const TENANT: &'static str = "tenant";
}

/// The instruments recorded by the scheduler and the querier.
/// Without a meter provider installed, the global meter is a no-op.
pub struct MetricRegistry {
    /// The number of queued requests per tenant.
    pub scheduler_queue_length: UpDownCounter<i64>,
    /// The number of requests rejected because the tenant queue was full.
    pub scheduler_discarded_requests: Counter<u64>,
    /// The number of queued requests skipped because they were cancelled.
    pub scheduler_cancelled_requests: Counter<u64>,
    /// The time a request spent in the queue. The unit is `s`.
    pub scheduler_queue_duration: Histogram<f64>,
    /// The sampled number of requests that are queued or being processed.
    pub scheduler_inflight_requests: Histogram<u64>,
    /// The number of connected frontend streams.
    pub scheduler_connected_frontend_clients: Gauge<u64>,
    /// The number of connected querier streams.
    pub scheduler_connected_querier_clients: Gauge<u64>,
    /// The number of pooled frontend clients on a querier.
    pub querier_frontend_clients: Gauge<u64>,
}

impl MetricRegistry {
    pub fn new(meter: &Meter) -> Self {
        Self {
            scheduler_queue_length: meter
                .i64_up_down_counter("ferry.scheduler.queue.length")
                .with_description("The number of queued requests per tenant.")
                .build(),
            scheduler_discarded_requests: meter
                .u64_counter("ferry.scheduler.discarded.requests")
                .with_description("The number of requests rejected because the tenant queue was full.")
                .build(),
            scheduler_cancelled_requests: meter
                .u64_counter("ferry.scheduler.cancelled.requests")
                .with_description("The number of queued requests skipped because they were cancelled.")
                .build(),
            scheduler_queue_duration: meter
                .f64_histogram("ferry.scheduler.queue.duration")
                .with_unit("s")
                .with_description("The time a request spent in the queue.")
                .build(),
            scheduler_inflight_requests: meter
                .u64_histogram("ferry.scheduler.inflight.requests")
                .with_description("The sampled number of queued or in-progress requests.")
                .build(),
            scheduler_connected_frontend_clients: meter
                .u64_gauge("ferry.scheduler.connected.frontend.clients")
                .with_description("The number of connected frontend streams.")
                .build(),
            scheduler_connected_querier_clients: meter
                .u64_gauge("ferry.scheduler.connected.querier.clients")
                .with_description("The number of connected querier streams.")
                .build(),
            querier_frontend_clients: meter
                .u64_gauge("ferry.querier.frontend.clients")
                .with_description("The number of pooled frontend clients.")
                .build(),
        }
    }

    /// Creates a registry backed by the global meter provider.
    pub fn global() -> Self {
        Self::new(&global::meter("ferry"))
    }
}

impl fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistry").finish()
    }
}
