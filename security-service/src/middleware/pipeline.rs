use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use service_core::middleware::tracing::RequestId;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;

/// Per-request state shared by the stages of one pipeline run.
#[derive(Debug, Default)]
pub struct StageContext {
    /// Socket peer, when the server was started with connect info.
    pub peer: Option<SocketAddr>,
    pub request_id: Option<String>,
    /// Headers added to the final response, whether a stage rejected the
    /// request or the handler produced it.
    pub response_headers: HeaderMap,
}

impl StageContext {
    pub fn for_request(request: &Request) -> Self {
        Self {
            peer: request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0),
            request_id: request
                .extensions()
                .get::<RequestId>()
                .map(|id| id.0.clone()),
            response_headers: HeaderMap::new(),
        }
    }

    fn apply(self, response: &mut Response) {
        for (name, value) in self.response_headers.iter() {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }
}

/// One security check. Returns the request to continue with, or the
/// response that ends processing.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn intercept(
        &self,
        request: Request,
        ctx: &mut StageContext,
    ) -> ControlFlow<Response, Request>;
}

/// Ordered chain of [`Interceptor`]s run before any handler.
#[derive(Clone, Default)]
pub struct SecurityPipeline {
    stages: Vec<Arc<dyn Interceptor>>,
}

impl SecurityPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: Arc<dyn Interceptor>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order, stopping at the first rejection.
    pub async fn process(
        &self,
        mut request: Request,
        ctx: &mut StageContext,
    ) -> ControlFlow<Response, Request> {
        for stage in &self.stages {
            match stage.intercept(request, ctx).await {
                ControlFlow::Continue(next) => request = next,
                ControlFlow::Break(response) => {
                    tracing::debug!(
                        stage = stage.name(),
                        request_id = ctx.request_id.as_deref().unwrap_or("-"),
                        "Request stopped by security stage"
                    );
                    metrics::counter!("security_rejections_total", "stage" => stage.name())
                        .increment(1);
                    return ControlFlow::Break(response);
                }
            }
        }
        ControlFlow::Continue(request)
    }
}

pub async fn security_pipeline_middleware(
    State(pipeline): State<Arc<SecurityPipeline>>,
    request: Request,
    next: Next,
) -> Response {
    let mut ctx = StageContext::for_request(&request);

    let mut response = match pipeline.process(request, &mut ctx).await {
        ControlFlow::Continue(request) => next.run(request).await,
        ControlFlow::Break(response) => response,
    };

    ctx.apply(&mut response);
    response
}
