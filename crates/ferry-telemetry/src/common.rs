/// W3C Trace Context header names used for context propagation
/// among services.
pub struct ContextPropagationHeader;

impl ContextPropagationHeader {
    pub const TRACEPARENT: &'static str = "traceparent";
}

/// Common span attribute names.
/// The name either follow the OpenTelemetry semantic conventions,
/// or is specific to Ferry.
pub struct SpanAttribute;

impl SpanAttribute {
    pub const EXCEPTION_MESSAGE: &'static str = "exception.message";
    pub const TENANT_ID: &'static str = "tenant.id";
    pub const QUERY_ID: &'static str = "query.id";
    pub const QUERIER_ID: &'static str = "querier.id";
    pub const FRONTEND_ADDRESS: &'static str = "frontend.address";
    pub const HTTP_METHOD: &'static str = "http.request.method";
    pub const HTTP_URL: &'static str = "url.full";
    pub const HTTP_STATUS_CODE: &'static str = "http.response.status_code";
}
