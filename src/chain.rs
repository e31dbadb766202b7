//! Per-request interceptor chain.
//!
//! Interceptors are allocated fresh for every request from their registered
//! factories, kept in registration order, and followed by a terminal link
//! that calls the handler. [`Next`] hands the remaining links to the current
//! one; not running it ends the chain.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::assembler::Assembler;
use crate::component::{Handler, HandlerResult, Interceptor};
use crate::error::{ApiError, ApiResult};
use crate::request::Request;
use crate::response::Response;

/// Builds a fresh, wired interceptor link for one request.
pub type InterceptorFactory =
    fn(&Assembler, &Arc<Request>, &Arc<Response>) -> ApiResult<Box<dyn Link>>;

pub trait Link: Send {
    fn invoke<'a>(&'a mut self, req: &'a Request, next: Next<'a>) -> BoxFuture<'a, HandlerResult>;
}

/// The end of the chain: whatever finally answers the request.
pub trait Endpoint: Send {
    fn call<'a>(&'a mut self, req: &'a Request) -> BoxFuture<'a, HandlerResult>;
}

impl<H: Handler> Endpoint for H {
    fn call<'a>(&'a mut self, req: &'a Request) -> BoxFuture<'a, HandlerResult> {
        self.handle_request(req)
    }
}

struct InterceptorLink<I>(I);

impl<I: Interceptor> Link for InterceptorLink<I> {
    fn invoke<'a>(&'a mut self, req: &'a Request, next: Next<'a>) -> BoxFuture<'a, HandlerResult> {
        self.0.handle_request(req, next)
    }
}

struct Terminal(Box<dyn Endpoint>);

impl Link for Terminal {
    fn invoke<'a>(&'a mut self, req: &'a Request, _next: Next<'a>) -> BoxFuture<'a, HandlerResult> {
        self.0.call(req)
    }
}

/// Wraps an already built interceptor as a link.
pub fn link<I: Interceptor>(interceptor: I) -> Box<dyn Link> {
    Box::new(InterceptorLink(interceptor))
}

pub(crate) fn make_interceptor<I: Interceptor>(
    assembler: &Assembler,
    request: &Arc<Request>,
    response: &Arc<Response>,
) -> ApiResult<Box<dyn Link>> {
    Ok(link(assembler.build_interceptor::<I>(request, response)?))
}

/// Continuation over the links that follow the current one.
pub struct Next<'a> {
    links: &'a mut [Box<dyn Link>],
}

impl<'a> Next<'a> {
    pub fn run(self, req: &'a Request) -> BoxFuture<'a, HandlerResult> {
        match self.links.split_first_mut() {
            Some((head, rest)) => head.invoke(req, Next { links: rest }),
            None => Box::pin(async {
                Err(ApiError::InternalServerError(
                    "interceptor chain has no terminal link".to_string(),
                ))
            }),
        }
    }

    /// Links still to run, including the terminal one.
    pub fn remaining(&self) -> usize {
        self.links.len()
    }
}

pub struct Chain {
    links: Vec<Box<dyn Link>>,
}

impl Chain {
    /// Links run in the given order, then `endpoint`.
    pub fn new(mut links: Vec<Box<dyn Link>>, endpoint: Box<dyn Endpoint>) -> Self {
        links.push(Box::new(Terminal(endpoint)));
        Self { links }
    }

    /// Allocates one interceptor per factory for this request and closes the
    /// chain with `endpoint`.
    pub fn build(
        assembler: &Assembler,
        factories: &[InterceptorFactory],
        endpoint: Box<dyn Endpoint>,
        request: &Arc<Request>,
        response: &Arc<Response>,
    ) -> ApiResult<Self> {
        let links = factories
            .iter()
            .map(|factory| factory(assembler, request, response))
            .collect::<ApiResult<Vec<_>>>()?;
        Ok(Self::new(links, endpoint))
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub async fn invoke(&mut self, req: &Request) -> HandlerResult {
        Next {
            links: &mut self.links,
        }
        .run(req)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, HandlerBase};
    use crate::descriptor::Descriptor;
    use async_trait::async_trait;
    use axum::http::Method;
    use parking_lot::Mutex;
    use serde_json::json;

    type Trace = Mutex<Vec<String>>;

    fn record(req: &Request, step: &str) {
        if let Some(trace) = req.context().attachment_as::<Trace>("trace") {
            trace.lock().push(step.to_string());
        }
    }

    macro_rules! tracing_interceptor {
        ($name:ident, $label:literal) => {
            #[derive(Default)]
            struct $name {
                base: HandlerBase,
            }

            impl Component for $name {
                type Base = HandlerBase;
                fn describe(d: &mut Descriptor<Self>) {
                    d.base(|i| &mut i.base);
                }
            }

            #[async_trait]
            impl Interceptor for $name {
                async fn handle_request(&mut self, req: &Request, next: Next<'_>) -> HandlerResult {
                    record(req, concat!($label, " pre"));
                    let result = next.run(req).await;
                    record(req, concat!($label, " post"));
                    result
                }
            }
        };
    }

    tracing_interceptor!(Outer, "A");
    tracing_interceptor!(Inner, "B");

    #[derive(Default)]
    struct Gate {
        base: HandlerBase,
    }

    impl Component for Gate {
        type Base = HandlerBase;
        fn describe(d: &mut Descriptor<Self>) {
            d.base(|i| &mut i.base);
        }
    }

    #[async_trait]
    impl Interceptor for Gate {
        async fn handle_request(&mut self, req: &Request, _next: Next<'_>) -> HandlerResult {
            record(req, "gate");
            Err(ApiError::Unauthorized("missing token".into()))
        }
    }

    #[derive(Default)]
    struct Passive {
        base: HandlerBase,
    }

    impl Component for Passive {
        type Base = HandlerBase;
        fn describe(d: &mut Descriptor<Self>) {
            d.base(|i| &mut i.base);
        }
    }

    #[async_trait]
    impl Interceptor for Passive {}

    #[derive(Default)]
    struct Target {
        base: HandlerBase,
    }

    impl Component for Target {
        type Base = HandlerBase;
        fn describe(d: &mut Descriptor<Self>) {
            d.base(|h| &mut h.base);
        }
    }

    #[async_trait]
    impl Handler for Target {
        async fn handle_request(&mut self, req: &Request) -> HandlerResult {
            record(req, "H");
            Ok(json!({"handled": true}))
        }
    }

    fn traced_request() -> (Request, Arc<Trace>) {
        let req = Request::builder(Method::GET, "/trace").build();
        req.context().set_attachment("trace", Trace::default());
        let trace = req.context().attachment_as::<Trace>("trace").unwrap();
        (req, trace)
    }

    #[tokio::test]
    async fn test_nested_ordering() {
        let (req, trace) = traced_request();
        let mut chain = Chain::new(
            vec![link(Outer::default()), link(Inner::default())],
            Box::new(Target::default()),
        );
        assert_eq!(chain.len(), 3);

        let result = chain.invoke(&req).await.unwrap();
        assert_eq!(result, json!({"handled": true}));
        assert_eq!(
            *trace.lock(),
            vec!["A pre", "B pre", "H", "B post", "A post"]
        );
    }

    #[tokio::test]
    async fn test_interceptor_can_stop_propagation() {
        let (req, trace) = traced_request();
        let mut chain = Chain::new(
            vec![link(Outer::default()), link(Gate::default()), link(Inner::default())],
            Box::new(Target::default()),
        );

        let err = chain.invoke(&req).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
        assert_eq!(*trace.lock(), vec!["A pre", "gate", "A post"]);
    }

    #[tokio::test]
    async fn test_default_interceptor_forwards() {
        let (req, trace) = traced_request();
        let mut chain = Chain::new(vec![link(Passive::default())], Box::new(Target::default()));
        assert!(chain.invoke(&req).await.is_ok());
        assert_eq!(*trace.lock(), vec!["H"]);
    }

    #[tokio::test]
    async fn test_running_past_the_end_fails() {
        let req = Request::builder(Method::GET, "/").build();
        let mut links: Vec<Box<dyn Link>> = Vec::new();
        let next = Next { links: &mut links };
        assert_eq!(next.remaining(), 0);
        assert!(matches!(
            next.run(&req).await,
            Err(ApiError::InternalServerError(_))
        ));
    }

    #[tokio::test]
    async fn test_build_allocates_fresh_interceptors() {
        let mut registry = crate::descriptor::Registry::new();
        registry.register::<Outer>().unwrap();
        registry.register::<Inner>().unwrap();
        let assembler = Assembler::new(Arc::new(registry), None);
        let factories = [
            make_interceptor::<Outer> as InterceptorFactory,
            make_interceptor::<Inner>,
        ];

        let (req, trace) = traced_request();
        let req = Arc::new(req);
        let resp = Arc::new(Response::new());
        let mut chain = Chain::build(
            &assembler,
            &factories,
            Box::new(Target::default()),
            &req,
            &resp,
        )
        .unwrap();
        chain.invoke(&req).await.unwrap();
        assert_eq!(trace.lock().len(), 5);
    }
}
