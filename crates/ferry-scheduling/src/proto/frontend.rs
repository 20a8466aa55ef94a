use crate::proto::http::HttpResponse;

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryStats {
    #[prost(uint64, tag = "1")]
    pub wall_time_nanos: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryResultRequest {
    #[prost(uint64, tag = "1")]
    pub query_id: u64,
    #[prost(message, optional, tag = "2")]
    pub http_response: Option<HttpResponse>,
    #[prost(message, optional, tag = "3")]
    pub stats: Option<QueryStats>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryResultResponse {}

#[allow(clippy::all)]
mod gen {
    include!(concat!(env!("OUT_DIR"), "/ferry.frontend.FrontendForQuerier.rs"));
}

pub use gen::frontend_for_querier_client::FrontendForQuerierClient;
pub use gen::frontend_for_querier_server::{FrontendForQuerier, FrontendForQuerierServer};
