use tonic_build::manual::{Builder, Method, Service};

struct MethodSpec<'a> {
    name: &'a str,
    route_name: &'a str,
    input_type: &'a str,
    output_type: &'a str,
    streaming: bool,
}

impl<'a> MethodSpec<'a> {
    fn unary(name: &'a str, route_name: &'a str, input_type: &'a str, output_type: &'a str) -> Self {
        Self {
            name,
            route_name,
            input_type,
            output_type,
            streaming: false,
        }
    }

    fn bidi(name: &'a str, route_name: &'a str, input_type: &'a str, output_type: &'a str) -> Self {
        Self {
            streaming: true,
            ..Self::unary(name, route_name, input_type, output_type)
        }
    }

    fn build(self) -> Method {
        let builder = Method::builder()
            .name(self.name)
            .route_name(self.route_name)
            .input_type(self.input_type)
            .output_type(self.output_type)
            .codec_path("tonic::codec::ProstCodec");
        let builder = if self.streaming {
            builder.client_streaming().server_streaming()
        } else {
            builder
        };
        builder.build()
    }
}

fn service(package: &str, name: &str, methods: Vec<MethodSpec>) -> Service {
    methods
        .into_iter()
        .fold(Service::builder().name(name).package(package), |builder, method| {
            builder.method(method.build())
        })
        .build()
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    let scheduler_for_frontend = service(
        "ferry.scheduler",
        "SchedulerForFrontend",
        vec![MethodSpec::bidi(
            "frontend_loop",
            "FrontendLoop",
            "crate::proto::scheduler::FrontendToScheduler",
            "crate::proto::scheduler::SchedulerToFrontend",
        )],
    );
    let scheduler_for_querier = service(
        "ferry.scheduler",
        "SchedulerForQuerier",
        vec![
            MethodSpec::bidi(
                "querier_loop",
                "QuerierLoop",
                "crate::proto::scheduler::QuerierToScheduler",
                "crate::proto::scheduler::SchedulerToQuerier",
            ),
            MethodSpec::unary(
                "notify_querier_shutdown",
                "NotifyQuerierShutdown",
                "crate::proto::scheduler::NotifyQuerierShutdownRequest",
                "crate::proto::scheduler::NotifyQuerierShutdownResponse",
            ),
        ],
    );
    let frontend_for_querier = service(
        "ferry.frontend",
        "FrontendForQuerier",
        vec![MethodSpec::unary(
            "query_result",
            "QueryResult",
            "crate::proto::frontend::QueryResultRequest",
            "crate::proto::frontend::QueryResultResponse",
        )],
    );
    Builder::new().compile(&[
        scheduler_for_frontend,
        scheduler_for_querier,
        frontend_for_querier,
    ]);
}
