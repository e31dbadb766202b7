use std::any::type_name;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::{middleware, Router};
use tokio::signal;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::assembler::Assembler;
use crate::chain::{make_interceptor, InterceptorFactory};
use crate::component::{Handler, Interceptor};
use crate::config::Config;
use crate::db::Database;
use crate::descriptor::Registry;
use crate::dispatcher::{function, make_handler, Dispatcher, FunctionHandler, Route, Target};
use crate::error::RegistrationError;
use crate::middleware::logging_middleware;
use crate::request::Request;
use crate::response::Response;
use crate::token_funnel::TokenFunnel;

/// Collects routes, interceptors and admission settings, then validates
/// everything at once in [`ApiServer::build`].
pub struct ApiServer {
    config: Config,
    routes: Vec<Route>,
    interceptors: Vec<(&'static str, InterceptorFactory)>,
    registry: Registry,
    errors: Vec<RegistrationError>,
    not_found: Option<FunctionHandler>,
    db: Option<Database>,
    funnel: TokenFunnel,
}

impl ApiServer {
    pub fn new(config: Config) -> Self {
        let funnel = TokenFunnel::new(config.token_bucket_capacity);
        funnel.set_default_quota(config.default_token_quota);
        Self {
            config,
            routes: Vec::new(),
            interceptors: Vec::new(),
            registry: Registry::new(),
            errors: Vec::new(),
            not_found: None,
            db: None,
            funnel,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process-wide database handed to every service subtree.
    pub fn set_database(&mut self, db: Database) -> &mut Self {
        self.db = Some(db);
        self
    }

    pub fn token_funnel(&self) -> &TokenFunnel {
        &self.funnel
    }

    pub fn set_default_token_quota(&mut self, quota_per_sec: u32) -> &mut Self {
        self.funnel.set_default_quota(quota_per_sec);
        self
    }

    /// Quota for the route registered under `path`; 0 uses the default.
    pub fn set_token_quota(&mut self, path: &str, quota_per_sec: u32) -> &mut Self {
        self.funnel.set_quota(path, quota_per_sec);
        self
    }

    pub fn allow_cross_domain(&mut self, allow: bool) -> &mut Self {
        self.config.allow_cross_domain = allow;
        self
    }

    pub fn print_route_table(&mut self, print: bool) -> &mut Self {
        self.config.print_route_table = print;
        self
    }

    pub fn register_function<F, Fut>(&mut self, method: &str, path: &str, f: F) -> &mut Self
    where
        F: Fn(Arc<Request>, Arc<Response>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let target = Target::Function {
            name: type_name::<F>(),
            handler: function(f),
        };
        self.add_route(method, path, target);
        self
    }

    pub fn register_handler<H: Handler>(&mut self, method: &str, path: &str) -> &mut Self {
        if let Err(e) = self.registry.register::<H>() {
            self.errors.push(e);
            return self;
        }
        let target = Target::Handler {
            type_name: type_name::<H>(),
            factory: make_handler::<H>,
        };
        self.add_route(method, path, target);
        self
    }

    /// Interceptors wrap every handler route in registration order.
    pub fn register_interceptor<I: Interceptor>(&mut self) -> &mut Self {
        match self.registry.register::<I>() {
            Ok(()) => self
                .interceptors
                .push((type_name::<I>(), make_interceptor::<I>)),
            Err(e) => self.errors.push(e),
        }
        self
    }

    pub fn set_not_found_handler<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Arc<Request>, Arc<Response>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.not_found = Some(function(f));
        self
    }

    fn add_route(&mut self, method: &str, path: &str, target: Target) {
        let method = match Method::from_bytes(method.to_ascii_uppercase().as_bytes()) {
            Ok(method) if MethodFilter::try_from(method.clone()).is_ok() => method,
            _ => {
                self.errors
                    .push(RegistrationError::InvalidMethod(method.to_string()));
                return;
            }
        };
        if !path.starts_with('/') {
            self.errors
                .push(RegistrationError::InvalidPath(path.to_string()));
            return;
        }
        self.routes.push(Route {
            method,
            path: path.to_string(),
            target,
        });
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Validates every registration and wires the router.
    ///
    /// Every route gets a token quota entry so that it is metered; routes
    /// without an explicit quota follow the default.
    pub fn build(self) -> Result<Server, RegistrationError> {
        if let Some(e) = self.errors.into_iter().next() {
            return Err(e);
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            if !seen.insert((route.method.clone(), route.path.clone())) {
                return Err(RegistrationError::DuplicateRoute {
                    method: route.method.to_string(),
                    path: route.path.clone(),
                });
            }
        }

        let assembler = Assembler::new(Arc::new(self.registry), self.db);
        let interceptor_names: Vec<&str> =
            self.interceptors.iter().map(|(name, _)| *name).collect();
        let dispatcher = Dispatcher::new(
            assembler,
            self.funnel.clone(),
            self.interceptors.into_iter().map(|(_, factory)| factory).collect(),
            self.config.max_body_bytes,
        );

        let mut by_path: Vec<(String, MethodRouter)> = Vec::new();
        for (i, route) in self.routes.into_iter().enumerate() {
            self.funnel.autocomplete_quota(route.token_name());
            if self.config.print_route_table {
                debug!(
                    "register api handler: {} <{}> {} {}",
                    i,
                    route.method,
                    route.path,
                    route.target.name()
                );
            }

            let filter = MethodFilter::try_from(route.method.clone())
                .map_err(|_| RegistrationError::InvalidMethod(route.method.to_string()))?;
            let path = route.path.clone();
            let route = Arc::new(route);
            let d = dispatcher.clone();
            let endpoint = move |req: axum::extract::Request| {
                let d = d.clone();
                let route = Arc::clone(&route);
                async move { d.handle_http(&route, req).await }
            };

            match by_path.iter_mut().find(|(p, _)| *p == path) {
                Some((_, method_router)) => {
                    *method_router = std::mem::take(method_router).on(filter, endpoint);
                }
                None => by_path.push((path, on(filter, endpoint))),
            }
        }
        if self.config.print_route_table {
            for (i, name) in interceptor_names.iter().enumerate() {
                debug!("register api interceptor: {} {}", i, name);
            }
        }

        let mut router = Router::new();
        for (path, method_router) in by_path {
            router = router.route(&path, method_router);
        }

        if let Some(handler) = self.not_found {
            let route = Arc::new(Route {
                method: Method::GET,
                path: "<not-found>".to_string(),
                target: Target::Function {
                    name: "not_found",
                    handler,
                },
            });
            let d = dispatcher.clone();
            router = router.fallback(move |req: axum::extract::Request| {
                let d = d.clone();
                let route = Arc::clone(&route);
                async move { d.handle_unmatched(&route, req).await }
            });
        }

        let router = router.layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(logging_middleware)),
        );
        let router = if self.config.allow_cross_domain {
            router.layer(CorsLayer::permissive())
        } else {
            router
        };

        let replenish_every = self.config.replenish_interval();
        let replenisher = match tokio::runtime::Handle::try_current() {
            Ok(_) => Some(self.funnel.start_replenish_task(replenish_every)),
            Err(_) => None,
        };

        Ok(Server {
            router,
            bind_addr: self.config.bind_addr,
            dispatcher,
            replenisher,
            replenish_every,
        })
    }

    /// Like [`ApiServer::build`], but a registration error ends the process.
    pub fn build_or_exit(self) -> Server {
        match self.build() {
            Ok(server) => server,
            Err(e) => {
                error!(error = %e, "illegal route registration");
                std::process::exit(1);
            }
        }
    }
}

pub struct Server {
    router: Router,
    bind_addr: SocketAddr,
    dispatcher: Dispatcher,
    replenisher: Option<JoinHandle<()>>,
    replenish_every: Duration,
}

impl Server {
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn token_funnel(&self) -> &TokenFunnel {
        self.dispatcher.funnel()
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error>> {
        if self.replenisher.is_none() {
            let every = self.replenish_every;
            self.replenisher = Some(self.dispatcher.funnel().start_replenish_task(every));
        }
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        info!("routekit server listening on {}", self.bind_addr);

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        if let Some(task) = self.replenisher.take() {
            task.abort();
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
