use crate::proto::http::HttpRequest;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FrontendToSchedulerType {
    Init = 0,
    Enqueue = 1,
    Cancel = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SchedulerToFrontendStatus {
    Ok = 0,
    TooManyRequestsPerTenant = 1,
    Error = 2,
    ShuttingDown = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FrontendToScheduler {
    #[prost(enumeration = "FrontendToSchedulerType", tag = "1")]
    pub r#type: i32,
    /// The address of the frontend, only set in the `Init` message.
    #[prost(string, tag = "2")]
    pub frontend_address: String,
    /// Set for `Enqueue` and `Cancel` messages.
    #[prost(uint64, tag = "3")]
    pub query_id: u64,
    /// The tenant of an `Enqueue` message, possibly several tenants joined by `|`.
    #[prost(string, tag = "4")]
    pub tenant_id: String,
    #[prost(message, optional, tag = "5")]
    pub http_request: Option<HttpRequest>,
    #[prost(bool, tag = "6")]
    pub stats_enabled: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SchedulerToFrontend {
    #[prost(enumeration = "SchedulerToFrontendStatus", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub error: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QuerierToScheduler {
    /// Only set in the first message of a querier loop.
    #[prost(string, tag = "1")]
    pub querier_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SchedulerToQuerier {
    #[prost(uint64, tag = "1")]
    pub query_id: u64,
    #[prost(message, optional, tag = "2")]
    pub http_request: Option<HttpRequest>,
    /// Where the querier sends the response.
    #[prost(string, tag = "3")]
    pub frontend_address: String,
    #[prost(string, tag = "4")]
    pub tenant_id: String,
    #[prost(bool, tag = "5")]
    pub stats_enabled: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NotifyQuerierShutdownRequest {
    #[prost(string, tag = "1")]
    pub querier_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NotifyQuerierShutdownResponse {}

impl SchedulerToFrontend {
    pub fn with_status(status: SchedulerToFrontendStatus) -> Self {
        Self {
            status: status as i32,
            error: String::new(),
        }
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            status: SchedulerToFrontendStatus::Error as i32,
            error: error.into(),
        }
    }
}

#[allow(clippy::all)]
mod gen {
    include!(concat!(env!("OUT_DIR"), "/ferry.scheduler.SchedulerForFrontend.rs"));
    include!(concat!(env!("OUT_DIR"), "/ferry.scheduler.SchedulerForQuerier.rs"));
}

pub use gen::scheduler_for_frontend_client::SchedulerForFrontendClient;
pub use gen::scheduler_for_frontend_server::{SchedulerForFrontend, SchedulerForFrontendServer};
pub use gen::scheduler_for_querier_client::SchedulerForQuerierClient;
pub use gen::scheduler_for_querier_server::{SchedulerForQuerier, SchedulerForQuerierServer};
