use ferry_scheduling::proto::http::{HttpRequest, HttpResponse};
use ferry_scheduling::worker::{HandlerError, RequestContext, RequestHandler};
use log::debug;

/// Answers every request with a description of the request.
/// Deployments embed the querier as a library and supply their own handler.
pub struct EchoHandler;

#[tonic::async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(
        &self,
        ctx: &RequestContext,
        request: HttpRequest,
    ) -> Result<HttpResponse, HandlerError> {
        debug!("handling query {} for tenant {}", ctx.query_id, ctx.tenant_id);
        if request.method.is_empty() {
            return Err(HandlerError::Response(HttpResponse::with_text(
                400,
                "missing request method",
            )));
        }
        Ok(HttpResponse::with_text(
            200,
            format!(
                "{} {} ({} bytes) for tenant {}",
                request.method,
                request.url,
                request.body.len(),
                ctx.tenant_id
            ),
        ))
    }
}
