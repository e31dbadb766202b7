pub mod assembler;
pub mod chain;
pub mod component;
pub mod config;
pub mod context;
pub mod db;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod middleware;
pub mod request;
pub mod response;
pub mod server;
pub mod token_funnel;

pub use chain::Next;
pub use component::{
    Component, DaoBase, DataAccess, Handler, HandlerBase, HandlerResult, Interceptor, Service,
    ServiceBase,
};
pub use config::Config;
pub use context::RequestContext;
pub use db::{Database, DbError};
pub use descriptor::Descriptor;
pub use error::{ApiError, ApiResult, RegistrationError};
pub use request::Request;
pub use response::{ApiResponse, Response};
pub use server::{ApiServer, Server};
pub use token_funnel::TokenFunnel;
