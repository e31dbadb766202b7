//! Capabilities of the nodes that make up a request's object graph.
//!
//! A node's role follows from the base it embeds: [`HandlerBase`] for
//! handlers and interceptors, [`ServiceBase`] for services and [`DaoBase`]
//! for data-access nodes. The base is where the assembler injects the
//! request context and, depending on the role, the request/response pair or
//! the database handle.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::Connection;
use tracing::debug;

use crate::chain::Next;
use crate::context::RequestContext;
use crate::db::{Database, DbError, DbResult, DbSession};
use crate::descriptor::Descriptor;
use crate::error::ApiResult;
use crate::request::Request;
use crate::response::Response;

pub type HandlerResult = ApiResult<serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Handler,
    Service,
    DataAccess,
}

impl Role {
    pub fn capability(self) -> &'static str {
        match self {
            Role::Handler => "context/request injection",
            Role::Service => "context/connection injection",
            Role::DataAccess => "context/owner injection",
        }
    }
}

/// Implemented by the three base types; ties a base to its role.
pub trait ComponentBase: Default + Send + Sync + 'static {
    const ROLE: Role;
}

/// A node the assembler can allocate fresh and wire for each request.
pub trait Component: Default + Send + Sync + 'static {
    type Base: ComponentBase;

    /// Declares the base slot and the injectable fields.
    fn describe(d: &mut Descriptor<Self>);

    /// Runs once the node and everything below it are wired.
    fn init(&mut self) {}
}

/// Entry point of a registered route.
#[async_trait]
pub trait Handler: Component<Base = HandlerBase> {
    async fn handle_request(&mut self, req: &Request) -> HandlerResult;
}

/// Cross-cutting node wrapped around the handler.
///
/// The default behavior forwards to the next link. An implementation that
/// never calls [`Next::run`] ends the chain with its own result.
#[async_trait]
pub trait Interceptor: Component<Base = HandlerBase> {
    async fn handle_request(&mut self, req: &Request, next: Next<'_>) -> HandlerResult {
        next.run(req).await
    }
}

pub trait Service: Component<Base = ServiceBase> {}

impl<T: Component<Base = ServiceBase>> Service for T {}

pub trait DataAccess: Component<Base = DaoBase> {}

impl<T: Component<Base = DaoBase>> DataAccess for T {}

#[derive(Default, Debug)]
pub struct HandlerBase {
    ctx: Option<Arc<RequestContext>>,
    request: Option<Arc<Request>>,
    response: Option<Arc<Response>>,
}

impl ComponentBase for HandlerBase {
    const ROLE: Role = Role::Handler;
}

impl HandlerBase {
    pub(crate) fn bind(
        &mut self,
        ctx: Arc<RequestContext>,
        request: Arc<Request>,
        response: Arc<Response>,
    ) {
        self.ctx = Some(ctx);
        self.request = Some(request);
        self.response = Some(response);
    }

    /// The request's context, or a detached one for nodes built by hand.
    pub fn context(&self) -> Arc<RequestContext> {
        self.ctx
            .clone()
            .unwrap_or_else(|| Arc::new(RequestContext::detached()))
    }

    pub fn request(&self) -> Option<&Arc<Request>> {
        self.request.as_ref()
    }

    pub fn response(&self) -> Option<&Arc<Response>> {
        self.response.as_ref()
    }
}

/// Back-reference from data-access nodes to the service that owns them.
///
/// Cloning shares the same core; the connection handle is never copied.
#[derive(Clone, Debug)]
pub struct ServiceHandle {
    core: Arc<ServiceCore>,
}

#[derive(Debug)]
struct ServiceCore {
    owner: &'static str,
    ctx: Arc<RequestContext>,
    session: Arc<DbSession>,
}

impl ServiceHandle {
    pub(crate) fn new(
        owner: &'static str,
        ctx: Arc<RequestContext>,
        session: Arc<DbSession>,
    ) -> Self {
        Self {
            core: Arc::new(ServiceCore {
                owner,
                ctx,
                session,
            }),
        }
    }

    pub fn owner(&self) -> &'static str {
        self.core.owner
    }

    pub fn context(&self) -> &Arc<RequestContext> {
        &self.core.ctx
    }

    pub fn session(&self) -> &Arc<DbSession> {
        &self.core.session
    }

    pub fn ptr_eq(&self, other: &ServiceHandle) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

#[derive(Default, Debug)]
pub struct ServiceBase {
    handle: Option<ServiceHandle>,
}

impl ComponentBase for ServiceBase {
    const ROLE: Role = Role::Service;
}

impl ServiceBase {
    pub(crate) fn bind(&mut self, handle: ServiceHandle) {
        self.handle = Some(handle);
    }

    /// A base with its own connection to `db`, for exercising a service
    /// directly outside of any request.
    pub fn standalone(db: &Database) -> Self {
        Self {
            handle: Some(ServiceHandle::new(
                "standalone",
                Arc::new(RequestContext::detached()),
                Arc::new(DbSession::new(Some(db.clone()))),
            )),
        }
    }

    pub fn handle(&self) -> Option<&ServiceHandle> {
        self.handle.as_ref()
    }

    pub fn context(&self) -> Arc<RequestContext> {
        match &self.handle {
            Some(handle) => Arc::clone(handle.context()),
            None => Arc::new(RequestContext::detached()),
        }
    }

    pub fn session(&self) -> Option<&Arc<DbSession>> {
        self.handle.as_ref().map(ServiceHandle::session)
    }

    /// Runs `f` on the blocking pool against the shared connection.
    pub async fn with_conn<R, F>(&self, f: F) -> DbResult<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.session()
            .ok_or(DbError::NotConfigured)?
            .with_conn(f)
            .await
    }

    /// Opens a write transaction, waiting up to the busy timeout for any
    /// other writer to finish.
    pub async fn begin_transaction(&self) -> DbResult<()> {
        let session = self.session().ok_or(DbError::NotConfigured)?;
        session.begin().await?;
        debug!(
            request_id = %self.context().request_id(),
            owner = self.owner(),
            "transaction opened"
        );
        Ok(())
    }

    pub async fn commit_transaction(&self) -> DbResult<()> {
        debug!(
            request_id = %self.context().request_id(),
            owner = self.owner(),
            "committing transaction"
        );
        self.session().ok_or(DbError::NotConfigured)?.commit().await
    }

    pub async fn rollback_transaction(&self) -> DbResult<()> {
        debug!(
            request_id = %self.context().request_id(),
            owner = self.owner(),
            "rolling back transaction"
        );
        self.session().ok_or(DbError::NotConfigured)?.rollback().await
    }

    fn owner(&self) -> &'static str {
        self.handle.as_ref().map_or("unbound", ServiceHandle::owner)
    }
}

#[derive(Default, Debug)]
pub struct DaoBase {
    ctx: Option<Arc<RequestContext>>,
    owner: Option<ServiceHandle>,
    test_session: Option<Arc<DbSession>>,
}

impl ComponentBase for DaoBase {
    const ROLE: Role = Role::DataAccess;
}

impl DaoBase {
    pub(crate) fn bind(&mut self, ctx: Arc<RequestContext>, owner: ServiceHandle) {
        self.ctx = Some(ctx);
        self.owner = Some(owner);
    }

    /// A base with its own connection to `db`; takes precedence over any owner.
    pub fn standalone(db: &Database) -> Self {
        Self {
            ctx: None,
            owner: None,
            test_session: Some(Arc::new(DbSession::new(Some(db.clone())))),
        }
    }

    pub fn context(&self) -> Arc<RequestContext> {
        self.ctx
            .clone()
            .unwrap_or_else(|| Arc::new(RequestContext::detached()))
    }

    pub fn owner(&self) -> Option<&ServiceHandle> {
        self.owner.as_ref()
    }

    /// The handle statements run through, resolved via the owning service.
    pub fn session(&self) -> Option<&Arc<DbSession>> {
        self.test_session
            .as_ref()
            .or_else(|| self.owner.as_ref().map(ServiceHandle::session))
    }

    /// Runs `f` on the blocking pool against the shared connection.
    pub async fn with_conn<R, F>(&self, f: F) -> DbResult<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.session()
            .ok_or(DbError::NotConfigured)?
            .with_conn(f)
            .await
    }
}
