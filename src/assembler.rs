//! Builds the per-request object graph from registered descriptors.
//!
//! Every call allocates fresh nodes; nothing is cached between requests.
//! Each top-level service slot of a handler gets its own [`DbSession`],
//! services nested below it share that session, and data-access nodes reach
//! it only through their owner's [`ServiceHandle`].

use std::any::type_name;
use std::sync::Arc;

use tracing::{debug, error};

use crate::component::{
    Component, DataAccess, Handler, HandlerBase, Interceptor, Service, ServiceHandle,
};
use crate::context::RequestContext;
use crate::db::{Database, DbSession};
use crate::descriptor::{Registry, SlotAction};
use crate::error::ApiResult;
use crate::request::Request;
use crate::response::Response;

#[derive(Clone, Debug)]
pub struct Assembler {
    registry: Arc<Registry>,
    db: Option<Database>,
}

/// Borrowed per-request inputs threaded through the wiring functions.
pub(crate) struct Wiring<'a> {
    pub(crate) registry: &'a Registry,
    pub(crate) db: Option<&'a Database>,
    pub(crate) ctx: &'a Arc<RequestContext>,
}

impl Wiring<'_> {
    fn fresh_session(&self) -> Arc<DbSession> {
        Arc::new(DbSession::new(self.db.cloned()))
    }
}

impl Assembler {
    pub fn new(registry: Arc<Registry>, db: Option<Database>) -> Self {
        Self { registry, db }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn database(&self) -> Option<&Database> {
        self.db.as_ref()
    }

    fn wiring<'a>(&'a self, ctx: &'a Arc<RequestContext>) -> Wiring<'a> {
        Wiring {
            registry: &self.registry,
            db: self.db.as_ref(),
            ctx,
        }
    }

    pub fn build_handler<H: Handler>(
        &self,
        request: &Arc<Request>,
        response: &Arc<Response>,
    ) -> ApiResult<H> {
        self.build_front::<H>(request, response)
    }

    pub fn build_interceptor<I: Interceptor>(
        &self,
        request: &Arc<Request>,
        response: &Arc<Response>,
    ) -> ApiResult<I> {
        self.build_front::<I>(request, response)
    }

    /// Wires a service subtree outside of the handler graph, with a fresh session.
    pub fn build_service<S: Service>(&self, ctx: &Arc<RequestContext>) -> ApiResult<Arc<S>> {
        let wiring = self.wiring(ctx);
        wire_service::<S>(&wiring, wiring.fresh_session())
    }

    fn build_front<T: Component<Base = HandlerBase>>(
        &self,
        request: &Arc<Request>,
        response: &Arc<Response>,
    ) -> ApiResult<T> {
        let ctx = request.context();
        let wiring = self.wiring(ctx);
        let descriptor = self.registry.descriptor::<T>()?;
        let mut node = T::default();

        // Multipart bodies stay untouched so the file parts remain readable.
        let decode_body = !request.body().is_empty() && !request.is_multipart();
        if decode_body {
            for slot in descriptor.slots() {
                if let SlotAction::Data(decode) = &slot.action {
                    if let Err(e) = decode(&mut node, request.body()) {
                        error!(
                            request_id = %ctx.request_id(),
                            slot = slot.name(),
                            error = %e,
                            "can not decode request body into slot"
                        );
                    }
                }
            }
        }

        for slot in descriptor.slots() {
            if let SlotAction::Service { wire, .. } = &slot.action {
                wire(&mut node, &wiring, wiring.fresh_session())?;
            }
        }

        if let Some(base) = descriptor.base_slot() {
            base(&mut node).bind(Arc::clone(ctx), Arc::clone(request), Arc::clone(response));
        }
        node.init();
        debug!(request_id = %ctx.request_id(), node = descriptor.type_name(), "assembled");
        Ok(node)
    }
}

pub(crate) fn wire_service<S: Service>(
    wiring: &Wiring<'_>,
    session: Arc<DbSession>,
) -> ApiResult<Arc<S>> {
    let descriptor = wiring.registry.descriptor::<S>()?;
    let mut service = S::default();
    let handle = ServiceHandle::new(type_name::<S>(), Arc::clone(wiring.ctx), Arc::clone(&session));

    for slot in descriptor.slots() {
        if let SlotAction::DataAccess { wire, .. } = &slot.action {
            wire(&mut service, wiring, &handle)?;
        }
    }
    for slot in descriptor.slots() {
        if let SlotAction::Service { wire, .. } = &slot.action {
            wire(&mut service, wiring, Arc::clone(&session))?;
        }
    }

    if let Some(base) = descriptor.base_slot() {
        base(&mut service).bind(handle);
    }
    service.init();
    Ok(Arc::new(service))
}

pub(crate) fn wire_data_access<D: DataAccess>(
    wiring: &Wiring<'_>,
    owner: &ServiceHandle,
) -> ApiResult<Arc<D>> {
    let descriptor = wiring.registry.descriptor::<D>()?;
    let mut node = D::default();
    if let Some(base) = descriptor.base_slot() {
        base(&mut node).bind(Arc::clone(wiring.ctx), owner.clone());
    }
    node.init();
    Ok(Arc::new(node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{DaoBase, HandlerResult, ServiceBase};
    use crate::descriptor::Descriptor;
    use async_trait::async_trait;
    use axum::http::Method;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static INIT_ORDER: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default)]
    struct LedgerDao {
        base: DaoBase,
        initialised_at: usize,
    }

    impl Component for LedgerDao {
        type Base = DaoBase;
        fn describe(d: &mut Descriptor<Self>) {
            d.base(|n| &mut n.base);
        }
        fn init(&mut self) {
            self.initialised_at = INIT_ORDER.fetch_add(1, Ordering::SeqCst) + 1;
        }
    }

    #[derive(Default)]
    struct AuditService {
        base: ServiceBase,
        ledger: Option<Arc<LedgerDao>>,
    }

    impl Component for AuditService {
        type Base = ServiceBase;
        fn describe(d: &mut Descriptor<Self>) {
            d.base(|s| &mut s.base).data_access("ledger", |s| &mut s.ledger);
        }
    }

    #[derive(Default)]
    struct PaymentService {
        base: ServiceBase,
        reads: Option<Arc<LedgerDao>>,
        writes: Option<Arc<LedgerDao>>,
        audit: Option<Arc<AuditService>>,
        initialised_at: usize,
    }

    impl Component for PaymentService {
        type Base = ServiceBase;
        fn describe(d: &mut Descriptor<Self>) {
            d.base(|s| &mut s.base)
                .data_access("reads", |s| &mut s.reads)
                .data_access("writes", |s| &mut s.writes)
                .service("audit", |s| &mut s.audit);
        }
        fn init(&mut self) {
            self.initialised_at = INIT_ORDER.fetch_add(1, Ordering::SeqCst) + 1;
        }
    }

    #[derive(Deserialize, Debug, PartialEq)]
    struct Transfer {
        amount: u64,
    }

    #[derive(Default)]
    struct TransferHandler {
        base: HandlerBase,
        transfer: Option<Box<Transfer>>,
        payments: Option<Arc<PaymentService>>,
        refunds: Option<Arc<PaymentService>>,
        untouched: u32,
    }

    impl Component for TransferHandler {
        type Base = HandlerBase;
        fn describe(d: &mut Descriptor<Self>) {
            d.base(|h| &mut h.base)
                .data("transfer", |h| &mut h.transfer)
                .service("payments", |h| &mut h.payments)
                .service("refunds", |h| &mut h.refunds);
        }
    }

    #[async_trait]
    impl Handler for TransferHandler {
        async fn handle_request(&mut self, _req: &Request) -> HandlerResult {
            Ok(serde_json::Value::Null)
        }
    }

    fn assembler() -> Assembler {
        let mut registry = Registry::new();
        registry.register::<TransferHandler>().unwrap();
        Assembler::new(Arc::new(registry), None)
    }

    fn request(body: &'static str, content_type: &str) -> Arc<Request> {
        Arc::new(
            Request::builder(Method::POST, "/transfer")
                .header("content-type", content_type)
                .body(body)
                .build(),
        )
    }

    #[test]
    fn test_graph_is_fully_wired() {
        let asm = assembler();
        let req = request(r#"{"amount": 12}"#, "application/json");
        let resp = Arc::new(Response::new());
        let handler: TransferHandler = asm.build_handler(&req, &resp).unwrap();

        assert_eq!(handler.transfer.as_deref(), Some(&Transfer { amount: 12 }));
        assert_eq!(handler.untouched, 0);
        assert!(Arc::ptr_eq(&handler.base.context(), req.context()));
        assert!(Arc::ptr_eq(handler.base.response().unwrap(), &resp));

        let payments = handler.payments.as_ref().unwrap();
        let reads = payments.reads.as_ref().unwrap();
        let writes = payments.writes.as_ref().unwrap();
        let audit = payments.audit.as_ref().unwrap();
        let session = payments.base.session().unwrap();

        // Data-access nodes and nested services share the owner's handle.
        assert!(Arc::ptr_eq(reads.base.session().unwrap(), session));
        assert!(Arc::ptr_eq(writes.base.session().unwrap(), session));
        assert!(Arc::ptr_eq(audit.base.session().unwrap(), session));
        assert!(Arc::ptr_eq(
            audit.ledger.as_ref().unwrap().base.session().unwrap(),
            session
        ));
        assert!(reads.base.owner().unwrap().ptr_eq(payments.base.handle().unwrap()));

        // Sibling top-level services get their own handles.
        let refunds = handler.refunds.as_ref().unwrap();
        assert!(!Arc::ptr_eq(refunds.base.session().unwrap(), session));

        // Children are initialised before their owner.
        assert!(reads.initialised_at < payments.initialised_at);
        assert!(writes.initialised_at < payments.initialised_at);
    }

    #[test]
    fn test_each_build_is_isolated() {
        let asm = assembler();
        let resp = Arc::new(Response::new());
        let first: TransferHandler = asm
            .build_handler(&request("{}", "application/json"), &resp)
            .unwrap();
        let second: TransferHandler = asm
            .build_handler(&request("{}", "application/json"), &resp)
            .unwrap();

        let a = first.payments.as_ref().unwrap();
        let b = second.payments.as_ref().unwrap();
        assert!(!Arc::ptr_eq(a, b));
        assert!(!Arc::ptr_eq(a.base.session().unwrap(), b.base.session().unwrap()));
        assert!(!Arc::ptr_eq(a.reads.as_ref().unwrap(), b.reads.as_ref().unwrap()));
        assert_ne!(first.base.context().request_id(), second.base.context().request_id());
    }

    #[test]
    fn test_multipart_body_is_not_decoded() {
        let asm = assembler();
        let req = request(r#"{"amount": 12}"#, "multipart/form-data; boundary=x");
        let handler: TransferHandler = asm
            .build_handler(&req, &Arc::new(Response::new()))
            .unwrap();
        assert!(handler.transfer.is_none());
        assert!(handler.payments.is_some());
    }

    #[test]
    fn test_bad_body_leaves_data_slot_empty() {
        let asm = assembler();
        let req = request("not json", "application/json");
        let handler: TransferHandler = asm
            .build_handler(&req, &Arc::new(Response::new()))
            .unwrap();
        assert!(handler.transfer.is_none());
        assert!(handler.payments.is_some());
    }

    #[test]
    fn test_unregistered_handler_fails() {
        let asm = Assembler::new(Arc::new(Registry::new()), None);
        let result = asm.build_handler::<TransferHandler>(
            &request("{}", "application/json"),
            &Arc::new(Response::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_standalone_service_subtree() {
        let asm = assembler();
        let ctx = Arc::new(RequestContext::new("job-1", "", "", ""));
        let payments: Arc<PaymentService> = asm.build_service(&ctx).unwrap();
        assert_eq!(payments.base.context().request_id(), "job-1");
        assert!(Arc::ptr_eq(
            payments.audit.as_ref().unwrap().base.session().unwrap(),
            payments.base.session().unwrap()
        ));
    }
}
