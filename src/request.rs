use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequest, Multipart};
use axum::http::header::CONTENT_TYPE;
use axum::http::{request::Parts, HeaderMap, HeaderName, HeaderValue, Method, Uri};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;

use crate::context::{RequestContext, HEADER_AUTH_TOKEN, HEADER_CLIENT_FLAG, HEADER_REQUEST_ID};
use crate::error::{ApiError, ApiResult};

/// Buffered inbound request as seen by handlers, interceptors and function handlers.
///
/// The body is read once by the dispatcher and kept, so it can be read any
/// number of times afterwards.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: RwLock<HeaderMap>,
    path_params: HashMap<String, String>,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
    ctx: Arc<RequestContext>,
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl Request {
    pub fn builder(method: Method, uri: &str) -> RequestBuilder {
        RequestBuilder {
            method,
            uri: uri.parse().unwrap_or_default(),
            headers: HeaderMap::new(),
            path_params: HashMap::new(),
            body: Bytes::new(),
            remote_addr: None,
        }
    }

    pub(crate) fn from_parts(
        parts: Parts,
        body: Bytes,
        path_params: HashMap<String, String>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        RequestBuilder {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            path_params,
            body,
            remote_addr,
        }
        .build()
    }

    pub fn context(&self) -> &Arc<RequestContext> {
        &self.ctx
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Header value as text; missing and non-UTF-8 values read as `None`.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .read()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn set_header(&self, name: &str, value: &str) -> ApiResult<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ApiError::InvalidRequest(format!("bad header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ApiError::InvalidRequest(format!("bad header value: {e}")))?;
        self.headers.write().insert(name, value);
        Ok(())
    }

    pub fn headers(&self) -> HeaderMap {
        self.headers.read().clone()
    }

    pub fn path_var(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    pub fn query(&self, name: &str) -> Option<String> {
        let query = self.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Urlencoded body fields take precedence over the query string.
    pub fn form_value(&self, name: &str) -> Option<String> {
        if self.content_type_contains("application/x-www-form-urlencoded") {
            let found = url::form_urlencoded::parse(&self.body)
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned());
            if found.is_some() {
                return found;
            }
        }
        self.query(name)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn json<T: DeserializeOwned>(&self) -> ApiResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type_contains("multipart")
    }

    fn content_type_contains(&self, needle: &str) -> bool {
        self.header(CONTENT_TYPE.as_str())
            .map(|ct| ct.to_ascii_lowercase().contains(needle))
            .unwrap_or(false)
    }

    /// First file part named `field` of a multipart body.
    pub async fn form_file(&self, field: &str) -> ApiResult<Option<UploadedFile>> {
        if !self.is_multipart() {
            return Err(ApiError::InvalidRequest(
                "request is not multipart/form-data".to_string(),
            ));
        }
        let mut builder = axum::http::Request::builder().method(self.method.clone());
        if let Some(ct) = self.headers.read().get(CONTENT_TYPE) {
            builder = builder.header(CONTENT_TYPE, ct.clone());
        }
        let http_req = builder
            .body(Body::from(self.body.clone()))
            .map_err(|e| ApiError::InternalServerError(e.to_string()))?;
        let mut multipart = Multipart::from_request(http_req, &())
            .await
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

        while let Some(part) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?
        {
            if part.name() != Some(field) {
                continue;
            }
            let file_name = part.file_name().map(str::to_string);
            let content_type = part.content_type().map(str::to_string);
            let data = part
                .bytes()
                .await
                .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
            return Ok(Some(UploadedFile {
                field: field.to_string(),
                file_name,
                content_type,
                data,
            }));
        }
        Ok(None)
    }
}

pub struct RequestBuilder {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    path_params: HashMap<String, String>,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
}

impl RequestBuilder {
    /// Invalid names or values are dropped.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path_params.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Builds the request and its context from the identity headers and the peer address.
    pub fn build(self) -> Request {
        let header = |name: &str| {
            self.headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let ctx = RequestContext::new(
            header(HEADER_REQUEST_ID),
            header(HEADER_AUTH_TOKEN),
            self.remote_addr.map(|a| a.to_string()).unwrap_or_default(),
            header(HEADER_CLIENT_FLAG),
        );
        Request {
            method: self.method,
            uri: self.uri,
            headers: RwLock::new(self.headers),
            path_params: self.path_params,
            body: self.body,
            remote_addr: self.remote_addr,
            ctx: Arc::new(ctx),
        }
    }
}
