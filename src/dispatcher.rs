//! Per-request pipeline for one registered route.
//!
//! context → token → object graph → interceptor chain → envelope. Everything
//! after admission runs inside a panic boundary, so a failing handler costs
//! one error response and never the process.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts, Path};
use axum::http::{Method, StatusCode};
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::assembler::Assembler;
use crate::chain::{Chain, Endpoint, InterceptorFactory};
use crate::component::Handler;
use crate::context::HEADER_REQUEST_ID;
use crate::error::{ApiResult, ErrorResponse};
use crate::request::Request;
use crate::response::{ApiResponse, Response};
use crate::token_funnel::TokenFunnel;

/// Plain async function answering a route through the request/response pair.
pub type FunctionHandler =
    Arc<dyn Fn(Arc<Request>, Arc<Response>) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) type HandlerFactory =
    fn(&Assembler, &Arc<Request>, &Arc<Response>) -> ApiResult<Box<dyn Endpoint>>;

pub(crate) fn make_handler<H: Handler>(
    assembler: &Assembler,
    request: &Arc<Request>,
    response: &Arc<Response>,
) -> ApiResult<Box<dyn Endpoint>> {
    Ok(Box::new(assembler.build_handler::<H>(request, response)?))
}

/// Wraps an async closure as a [`FunctionHandler`].
pub fn function<F, Fut>(f: F) -> FunctionHandler
where
    F: Fn(Arc<Request>, Arc<Response>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |req: Arc<Request>, resp: Arc<Response>| -> BoxFuture<'static, ()> {
        Box::pin(f(req, resp))
    })
}

#[derive(Clone)]
pub enum Target {
    Function {
        name: &'static str,
        handler: FunctionHandler,
    },
    Handler {
        type_name: &'static str,
        factory: HandlerFactory,
    },
}

impl Target {
    pub fn name(&self) -> &'static str {
        match self {
            Target::Function { name, .. } => *name,
            Target::Handler { type_name, .. } => *type_name,
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Function { name, .. } => f.debug_tuple("Function").field(name).finish(),
            Target::Handler { type_name, .. } => f.debug_tuple("Handler").field(type_name).finish(),
        }
    }
}

/// Registration record of one (method, path pattern) endpoint.
#[derive(Clone, Debug)]
pub struct Route {
    pub method: Method,
    pub path: String,
    pub target: Target,
}

impl Route {
    /// Admission is metered per path pattern.
    pub fn token_name(&self) -> &str {
        &self.path
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    assembler: Assembler,
    funnel: TokenFunnel,
    interceptors: Vec<InterceptorFactory>,
    max_body_bytes: usize,
}

impl Dispatcher {
    pub fn new(
        assembler: Assembler,
        funnel: TokenFunnel,
        interceptors: Vec<InterceptorFactory>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                assembler,
                funnel,
                interceptors,
                max_body_bytes,
            }),
        }
    }

    pub fn funnel(&self) -> &TokenFunnel {
        &self.inner.funnel
    }

    pub fn assembler(&self) -> &Assembler {
        &self.inner.assembler
    }

    /// Entry point from the router for a registered route.
    pub async fn handle_http(
        &self,
        route: &Route,
        request: axum::extract::Request,
    ) -> axum::response::Response {
        match self.read_request(route, request).await {
            Ok(request) => self.dispatch(route, request).await,
            Err(response) => response,
        }
    }

    /// Entry point for the not-found fallback; never metered.
    pub(crate) async fn handle_unmatched(
        &self,
        route: &Route,
        request: axum::extract::Request,
    ) -> axum::response::Response {
        match self.read_request(route, request).await {
            Ok(request) => self.execute(route, request).await,
            Err(response) => response,
        }
    }

    /// Buffers the body and builds the façade.
    async fn read_request(
        &self,
        route: &Route,
        request: axum::extract::Request,
    ) -> Result<Request, axum::response::Response> {
        let (mut parts, body) = request.into_parts();
        let path_params = Path::<HashMap<String, String>>::from_request_parts(&mut parts, &())
            .await
            .map(|Path(params)| params)
            .unwrap_or_default();
        let remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        match axum::body::to_bytes(body, self.inner.max_body_bytes).await {
            Ok(body) => Ok(Request::from_parts(parts, body, path_params, remote_addr)),
            Err(e) => {
                let request_id = parts
                    .headers
                    .get(HEADER_REQUEST_ID)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                warn!(
                    request_id = %request_id,
                    route = %route.path,
                    error = %e,
                    "can not read request body"
                );
                let response = Response::new();
                response.envelope(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    &ApiResponse::failed(
                        &request_id,
                        ErrorResponse::new("payload_too_large", &e.to_string(), 413),
                    ),
                );
                Err(response.take())
            }
        }
    }

    /// Waits for a token on the route, then runs it.
    pub async fn dispatch(&self, route: &Route, request: Request) -> axum::response::Response {
        self.inner
            .funnel
            .acquire(route.token_name(), Some(request.context().as_ref()))
            .await;
        self.execute(route, request).await
    }

    async fn execute(&self, route: &Route, request: Request) -> axum::response::Response {
        let request = Arc::new(request);
        let response = Arc::new(Response::new());
        let request_id = request.context().request_id().to_string();
        debug!(
            request_id = %request_id,
            route = %route.path,
            target = route.target.name(),
            "handle api request"
        );

        match &route.target {
            Target::Function { handler, .. } => {
                let run = async { handler(Arc::clone(&request), Arc::clone(&response)).await };
                if let Err(panic) = AssertUnwindSafe(run).catch_unwind().await {
                    recover(&request_id, &response, panic);
                }
            }
            Target::Handler { factory, .. } => {
                let run = async {
                    let endpoint = factory(&self.inner.assembler, &request, &response)?;
                    let mut chain = Chain::build(
                        &self.inner.assembler,
                        &self.inner.interceptors,
                        endpoint,
                        &request,
                        &response,
                    )?;
                    chain.invoke(&request).await
                };
                match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(Ok(data)) => {
                        response.envelope(StatusCode::OK, &ApiResponse::ok(&request_id, data))
                    }
                    Ok(Err(e)) => {
                        warn!(
                            request_id = %request_id,
                            route = %route.path,
                            error = %e,
                            "request failed"
                        );
                        response.envelope(
                            e.status(),
                            &ApiResponse::failed(&request_id, ErrorResponse::from_api_error(&e)),
                        );
                    }
                    Err(panic) => recover(&request_id, &response, panic),
                }
            }
        }

        response.take()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("funnel", &self.inner.funnel)
            .field("interceptors", &self.inner.interceptors.len())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn recover(request_id: &str, response: &Response, panic: Box<dyn Any + Send>) {
    let msg = panic_message(panic.as_ref());
    error!(request_id = %request_id, panic = %msg, "unhandled error");
    response.envelope(
        StatusCode::INTERNAL_SERVER_ERROR,
        &ApiResponse::failed(
            request_id,
            ErrorResponse::new(
                "internal_error",
                &format!("unhandled error <{request_id}> {msg}"),
                500,
            ),
        ),
    );
}

/// Routes panic reports through `tracing`, with a backtrace.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        error!(location = %location, "panic: {}\n{}", info, backtrace);
    }));
}
