//! Demo API served by the binary: a small user directory with an audit trail.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use routekit::chain::Next;
use routekit::{
    ApiError, ApiServer, Component, DaoBase, Database, DbError, Descriptor, Handler, HandlerBase,
    HandlerResult, Interceptor, Request, Response, ServiceBase,
};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

pub const MIGRATIONS: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    action TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
";

pub fn migrate(db: &Database) -> Result<(), DbError> {
    db.execute_batch(MIGRATIONS)
}

pub fn register(api: &mut ApiServer) {
    api.register_interceptor::<Timing>()
        .register_handler::<CreateUser>("POST", "/users")
        .register_handler::<ListUsers>("GET", "/users")
        .register_handler::<GetUser>("GET", "/users/:id")
        .register_function("GET", "/health", health)
        .register_function("POST", "/upload", upload)
        .set_not_found_handler(not_found);
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
}

#[derive(Default)]
pub struct UserRepo {
    base: DaoBase,
}

impl Component for UserRepo {
    type Base = DaoBase;
    fn describe(d: &mut Descriptor<Self>) {
        d.base(|r| &mut r.base);
    }
}

impl UserRepo {
    async fn insert(&self, user: &NewUser) -> Result<i64, DbError> {
        let (name, email) = (user.name.clone(), user.email.clone());
        self.base
            .with_conn(move |c| {
                c.execute(
                    "INSERT INTO users (name, email) VALUES (?1, ?2)",
                    params![name, email],
                )?;
                Ok(c.last_insert_rowid())
            })
            .await
    }

    async fn find(&self, id: i64) -> Result<Option<User>, DbError> {
        self.base
            .with_conn(move |c| {
                c.query_row(
                    "SELECT id, name, email FROM users WHERE id = ?1",
                    params![id],
                    |r| {
                        Ok(User {
                            id: r.get(0)?,
                            name: r.get(1)?,
                            email: r.get(2)?,
                        })
                    },
                )
                .optional()
            })
            .await
    }

    async fn list(&self) -> Result<Vec<User>, DbError> {
        self.base
            .with_conn(|c| {
                let mut stmt = c.prepare("SELECT id, name, email FROM users ORDER BY id")?;
                let rows = stmt.query_map([], |r| {
                    Ok(User {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        email: r.get(2)?,
                    })
                })?;
                rows.collect()
            })
            .await
    }
}

#[derive(Default)]
pub struct AuditRepo {
    base: DaoBase,
}

impl Component for AuditRepo {
    type Base = DaoBase;
    fn describe(d: &mut Descriptor<Self>) {
        d.base(|r| &mut r.base);
    }
}

impl AuditRepo {
    async fn record(&self, action: &str) -> Result<(), DbError> {
        let request_id = self.base.context().request_id().to_string();
        let action = action.to_string();
        self.base
            .with_conn(move |c| {
                c.execute(
                    "INSERT INTO audit_log (request_id, action) VALUES (?1, ?2)",
                    params![request_id, action],
                )
                .map(|_| ())
            })
            .await
    }
}

#[derive(Default)]
pub struct AuditService {
    base: ServiceBase,
    log: Option<Arc<AuditRepo>>,
}

impl Component for AuditService {
    type Base = ServiceBase;
    fn describe(d: &mut Descriptor<Self>) {
        d.base(|s| &mut s.base).data_access("log", |s| &mut s.log);
    }
}

impl AuditService {
    async fn record(&self, action: &str) -> Result<(), ApiError> {
        let log = self.log.as_ref().ok_or_else(|| missing("audit log"))?;
        Ok(log.record(action).await?)
    }
}

#[derive(Default)]
pub struct UserService {
    base: ServiceBase,
    users: Option<Arc<UserRepo>>,
    audit: Option<Arc<AuditService>>,
}

impl Component for UserService {
    type Base = ServiceBase;
    fn describe(d: &mut Descriptor<Self>) {
        d.base(|s| &mut s.base)
            .data_access("users", |s| &mut s.users)
            .service("audit", |s| &mut s.audit);
    }
}

impl UserService {
    fn repo(&self) -> Result<&UserRepo, ApiError> {
        self.users.as_deref().ok_or_else(|| missing("user repository"))
    }

    /// Inserts the user and its audit entry in one transaction.
    async fn create(&self, user: &NewUser) -> Result<User, ApiError> {
        if user.name.trim().is_empty() || !user.email.contains('@') {
            return Err(ApiError::ValidationError(
                "name must be non-empty and email must contain @".to_string(),
            ));
        }
        let audit = self.audit.as_ref().ok_or_else(|| missing("audit service"))?;

        self.base.begin_transaction().await?;
        match self.insert_audited(user, audit).await {
            Ok(id) => {
                self.base.commit_transaction().await?;
                Ok(User {
                    id,
                    name: user.name.clone(),
                    email: user.email.clone(),
                })
            }
            Err(e) => {
                self.base.rollback_transaction().await?;
                Err(e)
            }
        }
    }

    async fn insert_audited(&self, user: &NewUser, audit: &AuditService) -> Result<i64, ApiError> {
        let id = self.repo()?.insert(user).await?;
        audit.record(&format!("create user {id}")).await?;
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<User, ApiError> {
        self.repo()?
            .find(id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("user {id}")))
    }

    async fn list(&self) -> Result<Vec<User>, ApiError> {
        Ok(self.repo()?.list().await?)
    }
}

fn missing(what: &str) -> ApiError {
    ApiError::InternalServerError(format!("{what} is not wired"))
}

#[derive(Default)]
pub struct CreateUser {
    base: HandlerBase,
    user: Option<Box<NewUser>>,
    users: Option<Arc<UserService>>,
}

impl Component for CreateUser {
    type Base = HandlerBase;
    fn describe(d: &mut Descriptor<Self>) {
        d.base(|h| &mut h.base)
            .data("user", |h| &mut h.user)
            .service("users", |h| &mut h.users);
    }
}

#[async_trait]
impl Handler for CreateUser {
    async fn handle_request(&mut self, _req: &Request) -> HandlerResult {
        let user = self
            .user
            .as_deref()
            .ok_or_else(|| ApiError::InvalidRequest("expected a JSON user body".to_string()))?;
        let users = self.users.as_ref().ok_or_else(|| missing("user service"))?;
        let created = users.create(user).await?;
        if let Some(resp) = self.base.response() {
            resp.set_header("location", &format!("/users/{}", created.id))?;
        }
        Ok(serde_json::to_value(created)?)
    }
}

#[derive(Default)]
pub struct GetUser {
    base: HandlerBase,
    users: Option<Arc<UserService>>,
}

impl Component for GetUser {
    type Base = HandlerBase;
    fn describe(d: &mut Descriptor<Self>) {
        d.base(|h| &mut h.base).service("users", |h| &mut h.users);
    }
}

#[async_trait]
impl Handler for GetUser {
    async fn handle_request(&mut self, req: &Request) -> HandlerResult {
        let id: i64 = req
            .path_var("id")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ApiError::InvalidRequest("id must be an integer".to_string()))?;
        let users = self.users.as_ref().ok_or_else(|| missing("user service"))?;
        Ok(serde_json::to_value(users.get(id).await?)?)
    }
}

#[derive(Default)]
pub struct ListUsers {
    base: HandlerBase,
    users: Option<Arc<UserService>>,
}

impl Component for ListUsers {
    type Base = HandlerBase;
    fn describe(d: &mut Descriptor<Self>) {
        d.base(|h| &mut h.base).service("users", |h| &mut h.users);
    }
}

#[async_trait]
impl Handler for ListUsers {
    async fn handle_request(&mut self, _req: &Request) -> HandlerResult {
        let users = self.users.as_ref().ok_or_else(|| missing("user service"))?;
        Ok(serde_json::to_value(users.list().await?)?)
    }
}

/// Logs how long the rest of the chain took.
#[derive(Default)]
pub struct Timing {
    base: HandlerBase,
}

impl Component for Timing {
    type Base = HandlerBase;
    fn describe(d: &mut Descriptor<Self>) {
        d.base(|i| &mut i.base);
    }
}

#[async_trait]
impl Interceptor for Timing {
    async fn handle_request(&mut self, req: &Request, next: Next<'_>) -> HandlerResult {
        let started = Instant::now();
        let result = next.run(req).await;
        info!(
            request_id = %self.base.context().request_id(),
            path = %req.path(),
            ok = result.is_ok(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "handled"
        );
        result
    }
}

async fn health(_req: Arc<Request>, resp: Arc<Response>) {
    let _ = resp.write_json(&json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }));
}

async fn upload(req: Arc<Request>, resp: Arc<Response>) {
    let reply = match req.form_file("file").await {
        Ok(Some(file)) => json!({
            "file_name": file.file_name,
            "size": file.data.len(),
        }),
        Ok(None) => {
            resp.set_status(axum::http::StatusCode::BAD_REQUEST);
            json!({"error": "no file part named `file`"})
        }
        Err(e) => {
            resp.set_status(e.status());
            json!({"error": e.to_string()})
        }
    };
    let _ = resp.write_json(&reply);
}

async fn not_found(req: Arc<Request>, resp: Arc<Response>) {
    resp.set_status(axum::http::StatusCode::NOT_FOUND);
    let _ = resp.write_json(&json!({
        "request_id": req.context().request_id(),
        "error": format!("no route for {} {}", req.method(), req.path()),
    }));
}
